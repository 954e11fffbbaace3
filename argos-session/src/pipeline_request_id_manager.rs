use std::collections::{HashMap, VecDeque};

use log::warn;
use parking_lot::Mutex;

use crate::SessionError;

/// Nombre de trames conservées avant élagage des plus anciennes
const MAX_TRACKED_FRAMES: usize = 128;

struct State {
    /// (pipeline, trame) → identifiant de requête de l'appelant
    request_ids: HashMap<(u32, u32), u32>,

    /// Trames dans l'ordre d'insertion, pour l'élagage
    frame_order: VecDeque<(u32, u32)>,
}

/// Table de routage (pipeline, numéro de trame) → identifiant de requête du
/// bloc, pour réétiqueter les rappels HWL par pipeline.
pub struct PipelineRequestIdManager {
    state: Mutex<State>,
}

impl PipelineRequestIdManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                request_ids: HashMap::new(),
                frame_order: VecDeque::new(),
            }),
        }
    }

    /// Mémorise l'identifiant de requête pour un couple (pipeline, trame).
    /// Échoue si le couple est déjà présent.
    pub fn set_pipeline_request_id(
        &self,
        request_id: u32,
        pipeline_id: u32,
        frame_number: u32,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let key = (pipeline_id, frame_number);
        if state.request_ids.contains_key(&key) {
            return Err(SessionError::AlreadyExists(format!(
                "Requête déjà suivie pour le pipeline {} trame {}",
                pipeline_id, frame_number
            )));
        }

        state.request_ids.insert(key, request_id);
        state.frame_order.push_back(key);

        // Élagage des couples les plus anciens
        while state.frame_order.len() > MAX_TRACKED_FRAMES {
            if let Some(old_key) = state.frame_order.pop_front() {
                if state.request_ids.remove(&old_key).is_some() {
                    warn!(
                        "Élagage du suivi pipeline {} trame {}",
                        old_key.0, old_key.1
                    );
                }
            }
        }

        Ok(())
    }

    /// Retire un couple (pipeline, trame) du suivi. Utilisé pour défaire
    /// les enregistrements d'un lot jamais soumis. Silencieux si absent.
    pub fn remove_pipeline_request_id(&self, pipeline_id: u32, frame_number: u32) {
        let mut state = self.state.lock();
        let key = (pipeline_id, frame_number);
        if state.request_ids.remove(&key).is_some() {
            state.frame_order.retain(|entry| *entry != key);
        }
    }

    /// Retrouve l'identifiant de requête d'un couple (pipeline, trame)
    pub fn get_pipeline_request_id(
        &self,
        pipeline_id: u32,
        frame_number: u32,
    ) -> Result<u32, SessionError> {
        self.state
            .lock()
            .request_ids
            .get(&(pipeline_id, frame_number))
            .copied()
            .ok_or_else(|| {
                SessionError::NotFound(format!(
                    "Aucune requête suivie pour le pipeline {} trame {}",
                    pipeline_id, frame_number
                ))
            })
    }
}

impl Default for PipelineRequestIdManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let manager = PipelineRequestIdManager::new();
        manager.set_pipeline_request_id(7, 0, 100).unwrap();
        manager.set_pipeline_request_id(8, 1, 100).unwrap();

        assert_eq!(manager.get_pipeline_request_id(0, 100).unwrap(), 7);
        assert_eq!(manager.get_pipeline_request_id(1, 100).unwrap(), 8);
        assert!(manager.get_pipeline_request_id(2, 100).is_err());
    }

    #[test]
    fn test_duplicate_rejected() {
        let manager = PipelineRequestIdManager::new();
        manager.set_pipeline_request_id(7, 0, 100).unwrap();
        assert!(manager.set_pipeline_request_id(9, 0, 100).is_err());
    }

    #[test]
    fn test_remove_frees_the_slot() {
        let manager = PipelineRequestIdManager::new();
        manager.set_pipeline_request_id(7, 0, 100).unwrap();

        manager.remove_pipeline_request_id(0, 100);
        assert!(manager.get_pipeline_request_id(0, 100).is_err());

        // L'emplacement libéré se réutilise
        manager.set_pipeline_request_id(9, 0, 100).unwrap();
        assert_eq!(manager.get_pipeline_request_id(0, 100).unwrap(), 9);

        // Retrait d'un couple inconnu: silencieux
        manager.remove_pipeline_request_id(3, 3);
    }

    #[test]
    fn test_old_frames_pruned() {
        let manager = PipelineRequestIdManager::new();
        for frame_number in 0..(MAX_TRACKED_FRAMES as u32 + 10) {
            manager
                .set_pipeline_request_id(frame_number, 0, frame_number)
                .unwrap();
        }

        assert!(manager.get_pipeline_request_id(0, 0).is_err());
        assert!(manager
            .get_pipeline_request_id(0, MAX_TRACKED_FRAMES as u32 + 9)
            .is_ok());
    }
}
