use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use argos_core::{
    CaptureResult, HalStream, Metadata, NotifyMessage, RequestTemplate, StreamBuffer,
    StreamConfiguration,
};

pub mod allocator;
pub mod depth;
pub mod simulator;
pub mod zoom;

pub use allocator::{BufferInterop, InternalBufferAllocator, SimpleBufferAllocator};
pub use depth::{
    DepthBuffer, DepthGenerator, DepthGeneratorFactory, DepthRequestInfo, DepthResultCallbackFn,
    DepthResultStatus, PlaneLayout, SimulatedDepthGenerator,
};
pub use simulator::{SimulatedHwlSession, SimulatorOptions};
pub use zoom::ZoomRatioMapper;

/// Erreur remontée par la couche HWL
#[derive(Error, Debug)]
pub enum HwlError {
    #[error("HWL non initialisé: {0}")]
    NoInit(String),

    #[error("Argument invalide: {0}")]
    BadValue(String),

    #[error("Déjà configuré: {0}")]
    AlreadyExists(String),

    #[error("Ressource indisponible: {0}")]
    Unavailable(String),

    #[error("Opération non supportée: {0}")]
    Unsupported(String),

    #[error("Erreur interne du HWL: {0}")]
    Internal(String),
}

/// Requête soumise à un pipeline HWL
#[derive(Debug, Clone, Default)]
pub struct HwlPipelineRequest {
    /// Pipeline destinataire
    pub pipeline_id: u32,

    /// Réglages de la requête
    pub settings: Option<Metadata>,

    /// Buffers d'entrée
    pub input_buffers: Vec<StreamBuffer>,

    /// Une métadonnée par buffer d'entrée
    pub input_buffer_metadata: Vec<Option<Metadata>>,

    /// Buffers de sortie à remplir
    pub output_buffers: Vec<StreamBuffer>,

    /// Réglages par caméra physique
    pub physical_camera_settings: BTreeMap<u32, Metadata>,
}

/// Résultat produit par un pipeline HWL
#[derive(Debug, Clone, Default)]
pub struct HwlPipelineResult {
    /// Caméra d'origine
    pub camera_id: u32,

    /// Pipeline d'origine
    pub pipeline_id: u32,

    /// Numéro de trame du pipeline
    pub frame_number: u32,

    /// Indice de résultat partiel, à base 1
    pub partial_result: u32,

    /// Métadonnées de résultat
    pub result_metadata: Option<Metadata>,

    /// Buffers d'entrée restitués
    pub input_buffers: Vec<StreamBuffer>,

    /// Buffers de sortie complétés
    pub output_buffers: Vec<StreamBuffer>,

    /// Métadonnées par caméra physique
    pub physical_metadata: BTreeMap<u32, Metadata>,
}

impl From<HwlPipelineResult> for CaptureResult {
    fn from(result: HwlPipelineResult) -> Self {
        CaptureResult {
            frame_number: result.frame_number,
            result_metadata: result.result_metadata,
            partial_result: result.partial_result,
            output_buffers: result.output_buffers,
            input_buffers: result.input_buffers,
            physical_metadata: result.physical_metadata,
        }
    }
}

/// Fonction de rappel pour les résultats de pipeline
pub type HwlProcessPipelineResultFn = Arc<dyn Fn(HwlPipelineResult) + Send + Sync>;

/// Fonction de rappel pour les messages de pipeline, avec l'identifiant du
/// pipeline émetteur
pub type HwlNotifyPipelineMessageFn = Arc<dyn Fn(u32, NotifyMessage) + Send + Sync>;

/// Rappels fournis par le bloc lors de la configuration d'un pipeline
#[derive(Clone)]
pub struct HwlPipelineCallback {
    /// Réception des résultats
    pub process_pipeline_result: HwlProcessPipelineResultFn,

    /// Réception des notifications
    pub notify: HwlNotifyPipelineMessageFn,
}

/// Demande de buffers supplémentaires émise par le HWL en cours de pipeline.
/// Renvoie les buffers obtenus, ou None si le framework ne peut pas fournir.
pub type HwlRequestBuffersFn =
    Arc<dyn Fn(i32, u32) -> Option<Vec<StreamBuffer>> + Send + Sync>;

/// Restitution de buffers excédentaires par le HWL
pub type HwlReturnBuffersFn = Arc<dyn Fn(Vec<StreamBuffer>) + Send + Sync>;

/// Rappels de session fournis au HWL pour la ré-entrée de buffers
#[derive(Clone)]
pub struct HwlSessionCallback {
    pub request_stream_buffers: HwlRequestBuffersFn,
    pub return_stream_buffers: HwlReturnBuffersFn,
}

/// Sévérité thermique remontée par la plateforme
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ThermalSeverity {
    None,
    Light,
    Moderate,
    Severe,
    Critical,
    Emergency,
    Shutdown,
}

/// Notification de changement de sévérité thermique
pub type NotifyThrottlingFn = Arc<dyn Fn(ThermalSeverity) + Send + Sync>;

/// Paire d'enregistrement/désenregistrement du rappel thermique
#[derive(Clone)]
pub struct ThermalCallback {
    pub register_thermal_changed_callback:
        Arc<dyn Fn(NotifyThrottlingFn) -> Result<(), HwlError> + Send + Sync>,
    pub unregister_thermal_changed_callback: Arc<dyn Fn() + Send + Sync>,
}

/// Contrat du HWL pour une session de dispositif ouverte.
///
/// Une implémentation programme les capteurs et l'ISP; le moteur de session
/// ne voit que ce contrat. Les rappels de pipeline arrivent sur des threads
/// du HWL, jamais sur le thread de soumission.
pub trait DeviceSessionHwl: Send + Sync {
    /// Identifiant de la caméra (logique ou physique) de la session
    fn get_camera_id(&self) -> u32;

    /// Identifiants des caméras physiques sous-jacentes. Vide pour un
    /// dispositif à capteur unique.
    fn get_physical_camera_ids(&self) -> Vec<u32>;

    /// Caractéristiques de la caméra de la session
    fn get_camera_characteristics(&self) -> Result<Metadata, HwlError>;

    /// Caractéristiques d'une caméra physique sous-jacente
    fn get_physical_camera_characteristics(
        &self,
        physical_camera_id: u32,
    ) -> Result<Metadata, HwlError>;

    /// Configure un pipeline pour `camera_id` et renvoie son identifiant.
    /// `pipeline_config` est le sous-ensemble de flux que le pipeline
    /// possède; `overall_config` est la configuration complète de la
    /// session, fournie pour le contexte inter-pipelines.
    fn configure_pipeline(
        &self,
        camera_id: u32,
        callback: HwlPipelineCallback,
        pipeline_config: &StreamConfiguration,
        overall_config: &StreamConfiguration,
    ) -> Result<u32, HwlError>;

    /// Construit tous les pipelines configurés. Aucune soumission n'est
    /// acceptée avant cet appel.
    fn build_pipelines(&self) -> Result<(), HwlError>;

    /// Détruit tous les pipelines. Idempotent.
    fn destroy_pipelines(&self);

    /// Flux HAL retenus pour un pipeline configuré
    fn get_configured_hal_streams(&self, pipeline_id: u32) -> Result<Vec<HalStream>, HwlError>;

    /// Soumet un lot de requêtes pour une trame. Les requêtes d'un même
    /// appel visant des caméras physiques distinctes sont capturées de
    /// manière synchronisée.
    fn submit_requests(
        &self,
        frame_number: u32,
        requests: Vec<HwlPipelineRequest>,
    ) -> Result<(), HwlError>;

    /// Annulation au mieux des requêtes en vol
    fn flush(&self) -> Result<(), HwlError>;

    /// Réglages par défaut pour un modèle de requête
    fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> Result<Metadata, HwlError>;

    /// Retire des métadonnées de résultat les entrées privées du HWL.
    /// Appelé pour les résultats de traitement intermédiaire.
    fn filter_result_metadata(&self, metadata: &mut Metadata);

    /// Préchauffe un pipeline avant la première trame
    fn prepare_pipeline(&self, pipeline_id: u32, frame_number: u32) -> Result<(), HwlError>;

    /// Indique si un changement de paramètres de session impose une
    /// reconfiguration des flux
    fn is_reconfiguration_required(
        &self,
        old_session_params: Option<&Metadata>,
        new_session_params: Option<&Metadata>,
    ) -> Result<bool, HwlError>;

    /// Installe les rappels de ré-entrée de buffers
    fn set_session_callback(&self, session_callback: HwlSessionCallback);

    /// Mapper de ratio de zoom fourni par le HWL, absent si le HWL ne
    /// remappe pas les régions
    fn get_zoom_ratio_mapper(&self) -> Option<ZoomRatioMapper>;

    /// Vrai si le dispositif supporte la gestion de buffers par le HAL
    /// (quota d'acquisition et requêtes de buffers en cours de pipeline)
    fn is_session_buffer_management_supported(&self) -> bool;
}
