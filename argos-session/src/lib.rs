use std::sync::Arc;

use thiserror::Error;

use argos_core::{CaptureResult, CoreError, NotifyMessage};
use argos_hwl::HwlError;

pub mod basic_capture_session;
pub mod basic_request_processor;
pub mod basic_result_processor;
pub mod camera_device_session;
pub mod capture_session;
pub mod depth_process_block;
pub mod dual_ir_capture_session;
pub mod dual_ir_depth_result_processor;
pub mod dual_ir_request_processor;
pub mod dual_ir_result_request_processor;
pub mod hal_utils;
pub mod hdrplus_capture_session;
pub mod hdrplus_process_block;
pub mod hdrplus_request_processor;
pub mod hdrplus_result_processor;
pub mod internal_stream_manager;
pub mod multicam_rt_process_block;
pub mod pending_requests_tracker;
pub mod pipeline_request_id_manager;
pub mod process_block;
pub mod realtime_process_block;
pub mod realtime_zsl_request_processor;
pub mod realtime_zsl_result_processor;
pub mod request_processor;
pub mod result_dispatcher;
pub mod result_processor;
pub mod rgbird_capture_session;
pub mod rgbird_depth_result_processor;
pub mod rgbird_result_request_processor;
pub mod rgbird_rt_request_processor;
pub mod stream_buffer_cache;
pub mod zsl_buffer_manager;

pub use camera_device_session::{CameraDeviceSession, SessionCallback};
pub use capture_session::{CaptureSession, CaptureSessionParams, SessionOptions};
pub use internal_stream_manager::InternalStreamManager;
pub use process_block::{
    ProcessBlock, ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
pub use request_processor::RequestProcessor;
pub use result_dispatcher::ResultDispatcher;
pub use result_processor::ResultProcessor;

/// Nombre de résultats partiels annoncé par le moteur: la métadonnée arrive
/// en une seule fois
pub const PARTIAL_RESULT_COUNT: u32 = 1;

/// Erreur du moteur de session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Argument invalide: {0}")]
    BadValue(String),

    #[error("Déjà configuré: {0}")]
    AlreadyExists(String),

    #[error("Composant non initialisé: {0}")]
    NoInit(String),

    #[error("Introuvable: {0}")]
    NotFound(String),

    #[error("Délai dépassé: {0}")]
    TimedOut(String),

    #[error("Ressource épuisée: {0}")]
    Exhausted(String),

    #[error("Erreur interne: {0}")]
    Internal(String),

    #[error("Erreur du HWL: {0}")]
    Hwl(#[from] HwlError),

    #[error("Erreur du modèle de données: {0}")]
    Core(#[from] CoreError),
}

/// Remise d'un résultat de capture au client de la session
pub type ProcessCaptureResultFn = Arc<dyn Fn(CaptureResult) + Send + Sync>;

/// Remise d'une notification au client de la session
pub type NotifyFn = Arc<dyn Fn(NotifyMessage) + Send + Sync>;
