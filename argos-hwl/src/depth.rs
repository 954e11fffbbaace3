use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;

use argos_core::{Metadata, PixelFormat, StreamBuffer};

use crate::HwlError;

/// Disposition d'un plan mémoire adressable par le générateur
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaneLayout {
    /// Pas de ligne en octets
    pub stride: u32,

    /// Nombre de lignes réellement allouées
    pub scanline: u32,
}

/// Buffer d'image présenté au générateur de profondeur: le handle du flux
/// plus la géométrie nécessaire au mapping CPU
#[derive(Debug, Clone, Default)]
pub struct DepthBuffer {
    /// Format du buffer
    pub format: Option<PixelFormat>,

    /// Plans mappés
    pub planes: Vec<PlaneLayout>,

    /// Largeur en pixels
    pub width: u32,

    /// Hauteur en pixels
    pub height: u32,

    /// Buffer du framework ou du pool interne sous-jacent
    pub framework_buffer: StreamBuffer,
}

/// Requête de génération de profondeur.
///
/// Les buffers restent la propriété de l'appelant et doivent rester valides
/// pendant toute la durée du traitement.
#[derive(Debug, Clone, Default)]
pub struct DepthRequestInfo {
    /// Numéro de trame, repris tel quel dans le rappel de résultat
    pub frame_number: u32,

    /// Buffers couleur (YUV issu du capteur RGB), au plus un
    pub color_buffer: Vec<DepthBuffer>,

    /// Buffers des capteurs infrarouges, une séquence par capteur
    pub ir_buffer: Vec<Vec<DepthBuffer>>,

    /// Buffer de profondeur à remplir
    pub depth_buffer: DepthBuffer,

    /// Réglages de la requête (région de recadrage notamment)
    pub settings: Option<Metadata>,

    /// Métadonnées décrivant la production du buffer couleur
    pub color_buffer_metadata: Option<Metadata>,
}

/// Issue d'une requête de génération
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthResultStatus {
    Ok,
    Error,
}

/// Rappel de complétion. Toujours invoqué depuis un thread différent de
/// celui qui a déposé la requête.
pub type DepthResultCallbackFn = Arc<dyn Fn(DepthResultStatus, u32) + Send + Sync>;

/// Contrat du générateur de profondeur.
///
/// Le fournisseur réel est un greffon chargé à l'initialisation; les tests
/// utilisent le générateur simulé ci-dessous.
pub trait DepthGenerator: Send + Sync {
    /// Dépose une requête pour traitement asynchrone
    fn enqueue_process_request(&self, info: DepthRequestInfo) -> Result<(), HwlError>;

    /// Traite la requête immédiatement, en bloquant l'appelant
    fn execute_process_request(&self, info: &DepthRequestInfo) -> Result<(), HwlError>;

    /// Installe le rappel de complétion pour le mode asynchrone
    fn set_result_callback(&self, callback: Option<DepthResultCallbackFn>);
}

/// Fabrique injectée à la création de la session, à la place d'un chargement
/// de symbole dynamique
pub type DepthGeneratorFactory = Arc<dyn Fn() -> Arc<dyn DepthGenerator> + Send + Sync>;

enum WorkItem {
    Process(DepthRequestInfo),
    Stop,
}

/// Générateur de profondeur simulé: un thread de travail qui valide la
/// requête et rappelle la complétion.
pub struct SimulatedDepthGenerator {
    sender: Sender<WorkItem>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    callback: Arc<Mutex<Option<DepthResultCallbackFn>>>,
    fail_requests: Arc<Mutex<bool>>,
}

impl SimulatedDepthGenerator {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = channel::bounded::<WorkItem>(16);
        let callback: Arc<Mutex<Option<DepthResultCallbackFn>>> = Arc::new(Mutex::new(None));
        let fail_requests = Arc::new(Mutex::new(false));

        let callback_for_worker = callback.clone();
        let fail_for_worker = fail_requests.clone();
        let worker = thread::spawn(move || {
            while let Ok(item) = receiver.recv() {
                match item {
                    WorkItem::Process(info) => {
                        let status = if *fail_for_worker.lock() || Self::validate(&info).is_err() {
                            DepthResultStatus::Error
                        } else {
                            DepthResultStatus::Ok
                        };
                        let callback = callback_for_worker.lock().clone();
                        match callback {
                            Some(callback) => callback(status, info.frame_number),
                            None => warn!(
                                "Résultat de profondeur sans rappel pour la trame {}",
                                info.frame_number
                            ),
                        }
                    }
                    WorkItem::Stop => break,
                }
            }
        });

        info!("Générateur de profondeur simulé démarré");

        Arc::new(Self {
            sender,
            worker: Mutex::new(Some(worker)),
            callback,
            fail_requests,
        })
    }

    /// Force l'échec des requêtes suivantes
    pub fn set_fail_requests(&self, fail: bool) {
        *self.fail_requests.lock() = fail;
    }

    fn validate(info: &DepthRequestInfo) -> Result<(), HwlError> {
        if info.ir_buffer.len() != 2 {
            return Err(HwlError::BadValue(format!(
                "Deux sources infrarouges attendues, {} reçues",
                info.ir_buffer.len()
            )));
        }
        if info.depth_buffer.width == 0 || info.depth_buffer.height == 0 {
            return Err(HwlError::BadValue(
                "Buffer de profondeur sans dimensions".to_string(),
            ));
        }
        Ok(())
    }
}

impl DepthGenerator for SimulatedDepthGenerator {
    fn enqueue_process_request(&self, info: DepthRequestInfo) -> Result<(), HwlError> {
        self.sender
            .send(WorkItem::Process(info))
            .map_err(|_| HwlError::Unavailable("Générateur arrêté".to_string()))
    }

    fn execute_process_request(&self, info: &DepthRequestInfo) -> Result<(), HwlError> {
        if *self.fail_requests.lock() {
            return Err(HwlError::Internal(
                "Échec forcé du générateur de profondeur".to_string(),
            ));
        }
        Self::validate(info)
    }

    fn set_result_callback(&self, callback: Option<DepthResultCallbackFn>) {
        *self.callback.lock() = callback;
    }
}

impl Drop for SimulatedDepthGenerator {
    fn drop(&mut self) {
        if self.sender.send(WorkItem::Stop).is_err() {
            error!("Thread du générateur de profondeur déjà arrêté");
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn make_info(frame_number: u32) -> DepthRequestInfo {
        DepthRequestInfo {
            frame_number,
            ir_buffer: vec![vec![DepthBuffer::default()], vec![DepthBuffer::default()]],
            depth_buffer: DepthBuffer {
                width: 640,
                height: 480,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_execute_validates() {
        let generator = SimulatedDepthGenerator::new();
        assert!(generator.execute_process_request(&make_info(1)).is_ok());

        let mut bad = make_info(2);
        bad.ir_buffer.pop();
        assert!(generator.execute_process_request(&bad).is_err());
    }

    #[test]
    fn test_enqueue_invokes_callback() {
        let generator = SimulatedDepthGenerator::new();
        let completed = Arc::new(AtomicU32::new(0));
        let completed_clone = completed.clone();

        generator.set_result_callback(Some(Arc::new(move |status, frame_number| {
            assert_eq!(status, DepthResultStatus::Ok);
            completed_clone.store(frame_number, Ordering::SeqCst);
        })));

        generator.enqueue_process_request(make_info(42)).unwrap();

        // Attendre la complétion asynchrone
        for _ in 0..100 {
            if completed.load(Ordering::SeqCst) == 42 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("le rappel de profondeur n'a pas été invoqué");
    }
}
