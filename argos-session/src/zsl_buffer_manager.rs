use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, warn};

use argos_core::{BufferHandle, HalStream, Metadata, Stream, StreamBuffer};
use argos_hwl::InternalBufferAllocator;

use crate::SessionError;

/// Entrée du cache zéro-délai: un buffer rempli et sa métadonnée appariée
#[derive(Debug, Clone)]
pub struct ZslEntry {
    /// Numéro de la trame qui a produit le buffer
    pub frame_number: u32,

    /// Buffer rempli
    pub buffer: StreamBuffer,

    /// Métadonnées de la trame
    pub metadata: Metadata,
}

#[derive(Default)]
struct PartialEntry {
    buffer: Option<StreamBuffer>,
    metadata: Option<Metadata>,
}

/// Pool de buffers borné d'un flux interne, doublé d'un anneau zéro-délai.
///
/// Aucun verrou interne: toutes les méthodes sont appelées sous le mutex du
/// gestionnaire de flux internes.
pub struct ZslBufferManager {
    stream: Stream,

    hal_stream: HalStream,

    allocator: Arc<dyn InternalBufferAllocator>,

    /// Buffers vides prêts à être distribués
    empty_buffers: VecDeque<BufferHandle>,

    /// Nombre de buffers alloués
    allocated: usize,

    /// Plafond d'allocation: max_buffers + supplément
    max_allocated: usize,

    /// Dépôts incomplets, en attente du buffer ou de la métadonnée
    partial: HashMap<u32, PartialEntry>,

    /// Anneau des entrées complètes, ordonné par numéro de trame
    filled: BTreeMap<u32, ZslEntry>,

    /// Entrées épinglées par un consommateur de cliché en cours
    pending: BTreeMap<u32, ZslEntry>,
}

impl ZslBufferManager {
    /// Crée le pool et alloue immédiatement `hal_stream.max_buffers`
    /// buffers. Le pool pourra croître jusqu'à `max_buffers + additional`.
    pub fn new(
        stream: Stream,
        hal_stream: HalStream,
        additional: u32,
        allocator: Arc<dyn InternalBufferAllocator>,
    ) -> Result<Self, SessionError> {
        let eager = hal_stream.max_buffers as usize;
        let handles = allocator
            .allocate_buffers(&stream, &hal_stream, eager)
            .map_err(|e| {
                SessionError::Internal(format!(
                    "Allocation initiale du flux {} échouée: {}",
                    stream.id, e
                ))
            })?;

        Ok(Self {
            max_allocated: eager + additional as usize,
            allocated: handles.len(),
            empty_buffers: handles.into_iter().collect(),
            partial: HashMap::new(),
            filled: BTreeMap::new(),
            pending: BTreeMap::new(),
            stream,
            hal_stream,
            allocator,
        })
    }

    /// Identifiant du flux propriétaire
    pub fn stream_id(&self) -> i32 {
        self.stream.id
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn hal_stream(&self) -> &HalStream {
        &self.hal_stream
    }

    /// Distribue un buffer vide. Si le pool est épuisé, alloue jusqu'au
    /// plafond, puis recycle la plus ancienne entrée remplie.
    pub fn get_empty_buffer(&mut self, stream_id: i32) -> Result<StreamBuffer, SessionError> {
        if let Some(handle) = self.empty_buffers.pop_front() {
            return Ok(Self::make_buffer(stream_id, handle));
        }

        if self.allocated < self.max_allocated {
            let mut handles = self
                .allocator
                .allocate_buffers(&self.stream, &self.hal_stream, 1)
                .map_err(|e| {
                    SessionError::Internal(format!(
                        "Croissance du pool du flux {} échouée: {}",
                        self.stream.id, e
                    ))
                })?;
            self.allocated += 1;
            return Ok(Self::make_buffer(stream_id, handles.remove(0)));
        }

        // Recycler la plus ancienne entrée de l'anneau
        if let Some((&oldest, _)) = self.filled.iter().next() {
            let entry = self.filled.remove(&oldest).unwrap();
            self.partial.remove(&oldest);
            debug!(
                "Flux {}: recyclage de l'entrée ZSL de la trame {}",
                self.stream.id, oldest
            );
            let handle = entry.buffer.buffer.ok_or_else(|| {
                SessionError::Internal("Entrée ZSL sans handle".to_string())
            })?;
            return Ok(Self::make_buffer(stream_id, handle));
        }

        Err(SessionError::Exhausted(format!(
            "Pool du flux {} à capacité ({} buffers)",
            self.stream.id, self.allocated
        )))
    }

    fn make_buffer(stream_id: i32, handle: BufferHandle) -> StreamBuffer {
        StreamBuffer {
            stream_id,
            buffer_id: handle.raw,
            buffer: Some(handle),
            ..Default::default()
        }
    }

    /// Restitue un buffer vide au pool
    pub fn return_empty_buffer(&mut self, buffer: &StreamBuffer) -> Result<(), SessionError> {
        let handle = buffer
            .buffer
            .ok_or_else(|| SessionError::BadValue("Buffer restitué sans handle".to_string()))?;
        self.empty_buffers.push_back(handle);
        Ok(())
    }

    /// Dépose un buffer rempli par la trame donnée. L'entrée rejoint
    /// l'anneau dès que la métadonnée correspondante est arrivée.
    pub fn return_filled_buffer(
        &mut self,
        frame_number: u32,
        buffer: &StreamBuffer,
    ) -> Result<(), SessionError> {
        if buffer.buffer.is_none() {
            return Err(SessionError::BadValue(
                "Buffer rempli sans handle".to_string(),
            ));
        }
        let entry = self.partial.entry(frame_number).or_default();
        entry.buffer = Some(buffer.clone());
        self.try_promote(frame_number);
        Ok(())
    }

    /// Dépose la métadonnée de la trame donnée
    pub fn return_metadata(
        &mut self,
        frame_number: u32,
        metadata: &Metadata,
    ) -> Result<(), SessionError> {
        let entry = self.partial.entry(frame_number).or_default();
        entry.metadata = Some(metadata.clone());
        self.try_promote(frame_number);
        Ok(())
    }

    fn try_promote(&mut self, frame_number: u32) {
        let complete = self
            .partial
            .get(&frame_number)
            .map(|entry| entry.buffer.is_some() && entry.metadata.is_some())
            .unwrap_or(false);
        if !complete {
            return;
        }

        let entry = self.partial.remove(&frame_number).unwrap();
        self.filled.insert(
            frame_number,
            ZslEntry {
                frame_number,
                buffer: entry.buffer.unwrap(),
                metadata: entry.metadata.unwrap(),
            },
        );
    }

    /// Nombre d'entrées complètes de l'anneau
    pub fn filled_count(&self) -> usize {
        self.filled.len()
    }

    /// Épingle et renvoie les `count` entrées les plus récentes. Échoue sans
    /// rien épingler si moins de `min_filled` entrées complètes existent.
    pub fn get_most_recent_entries(
        &mut self,
        count: usize,
        min_filled: usize,
    ) -> Result<Vec<ZslEntry>, SessionError> {
        if self.filled.len() < min_filled {
            return Err(SessionError::Exhausted(format!(
                "Flux {}: {} entrées complètes, minimum {}",
                self.stream.id,
                self.filled.len(),
                min_filled
            )));
        }

        let take = count.min(self.filled.len());
        let keys: Vec<u32> = self.filled.keys().rev().take(take).copied().collect();

        let mut entries = Vec::with_capacity(take);
        // Renvoyer en ordre croissant de trame
        for key in keys.into_iter().rev() {
            let entry = self.filled.remove(&key).unwrap();
            self.pending.insert(key, entry.clone());
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Désépingle les entrées prêtées et les rend à l'anneau. Le consommateur
    /// est unique à la fois, l'ensemble épinglé est donc rendu en bloc.
    pub fn return_pinned_entries(&mut self, frame_number: u32) {
        if self.pending.is_empty() {
            warn!(
                "Flux {}: aucune entrée épinglée à rendre pour la trame {}",
                self.stream.id, frame_number
            );
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        for (key, entry) in pending {
            self.filled.insert(key, entry);
        }
    }

    /// Vrai si aucune entrée n'est épinglée
    pub fn is_pending_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for ZslBufferManager {
    fn drop(&mut self) {
        let mut handles: Vec<BufferHandle> = self.empty_buffers.drain(..).collect();
        for entry in self.filled.values().chain(self.pending.values()) {
            if let Some(handle) = entry.buffer.buffer {
                handles.push(handle);
            }
        }
        for entry in self.partial.values() {
            if let Some(buffer) = &entry.buffer {
                if let Some(handle) = buffer.buffer {
                    handles.push(handle);
                }
            }
        }
        self.allocator.free_buffers(&handles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_hwl::SimpleBufferAllocator;

    fn make_manager(max_buffers: u32, additional: u32) -> ZslBufferManager {
        let stream = Stream {
            id: 100,
            width: 640,
            height: 480,
            ..Default::default()
        };
        let hal_stream = HalStream {
            id: 100,
            max_buffers,
            ..Default::default()
        };
        ZslBufferManager::new(stream, hal_stream, additional, SimpleBufferAllocator::new())
            .unwrap()
    }

    fn fill_entry(manager: &mut ZslBufferManager, frame_number: u32) {
        let buffer = manager.get_empty_buffer(100).unwrap();
        manager.return_filled_buffer(frame_number, &buffer).unwrap();
        manager
            .return_metadata(frame_number, &Metadata::new())
            .unwrap();
    }

    #[test]
    fn test_pool_grows_to_cap_then_recycles() {
        let mut manager = make_manager(2, 1);

        // 2 immédiats + 1 de croissance
        let b1 = manager.get_empty_buffer(100).unwrap();
        let b2 = manager.get_empty_buffer(100).unwrap();
        let _b3 = manager.get_empty_buffer(100).unwrap();

        // Pool à plafond et rien de rempli: échec
        assert!(manager.get_empty_buffer(100).is_err());

        // Remplir une entrée puis redemander: l'entrée est recyclée
        manager.return_filled_buffer(10, &b1).unwrap();
        manager.return_metadata(10, &Metadata::new()).unwrap();
        assert_eq!(manager.filled_count(), 1);
        let recycled = manager.get_empty_buffer(100).unwrap();
        assert_eq!(recycled.buffer, b1.buffer);
        assert_eq!(manager.filled_count(), 0);

        manager.return_empty_buffer(&b2).unwrap();
    }

    #[test]
    fn test_most_recent_selection_and_pinning() {
        let mut manager = make_manager(8, 0);
        for frame_number in [3, 7, 5, 9, 1] {
            fill_entry(&mut manager, frame_number);
        }

        // Les 3 plus récentes: 5, 7, 9, rendues en ordre croissant
        let entries = manager.get_most_recent_entries(3, 3).unwrap();
        let frames: Vec<u32> = entries.iter().map(|e| e.frame_number).collect();
        assert_eq!(frames, vec![5, 7, 9]);
        assert!(!manager.is_pending_empty());
        assert_eq!(manager.filled_count(), 2);

        // Rendu en bloc
        manager.return_pinned_entries(42);
        assert!(manager.is_pending_empty());
        assert_eq!(manager.filled_count(), 5);
    }

    #[test]
    fn test_minimum_filled_enforced() {
        let mut manager = make_manager(8, 0);
        fill_entry(&mut manager, 1);
        fill_entry(&mut manager, 2);

        assert!(manager.get_most_recent_entries(2, 3).is_err());
        // Rien n'a été épinglé
        assert!(manager.is_pending_empty());
        assert_eq!(manager.filled_count(), 2);
    }

    #[test]
    fn test_metadata_required_for_promotion() {
        let mut manager = make_manager(4, 0);
        let buffer = manager.get_empty_buffer(100).unwrap();
        manager.return_filled_buffer(20, &buffer).unwrap();

        // Buffer sans métadonnée: pas encore dans l'anneau
        assert_eq!(manager.filled_count(), 0);
        manager.return_metadata(20, &Metadata::new()).unwrap();
        assert_eq!(manager.filled_count(), 1);
    }
}
