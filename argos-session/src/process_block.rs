use argos_core::{CaptureRequest, CaptureResult, HalStream, NotifyMessage, StreamConfiguration};

use crate::SessionError;

/// Requête destinée à un bloc de traitement
#[derive(Debug, Clone, Default)]
pub struct ProcessBlockRequest {
    /// Identifiant unique de cette requête de bloc, choisi par l'émetteur.
    /// Permet au processeur de résultats de distinguer les retours quand une
    /// trame s'éclate sur plusieurs pipelines.
    pub request_id: u32,

    /// Requête de capture portée
    pub request: CaptureRequest,
}

/// Résultat produit par un bloc de traitement
#[derive(Debug, Clone, Default)]
pub struct ProcessBlockResult {
    /// Identifiant de la requête de bloc d'origine
    pub request_id: u32,

    /// Résultat de capture porté
    pub result: CaptureResult,
}

/// Notification produite par un bloc de traitement
#[derive(Debug, Clone, Copy)]
pub struct ProcessBlockNotifyMessage {
    /// Identifiant de la requête de bloc d'origine
    pub request_id: u32,

    /// Message porté
    pub message: NotifyMessage,
}

/// Contrat d'un bloc de traitement. Un bloc traite des requêtes de capture
/// sur un pipeline HWL (capteur, ISP, GPU ou logiciel) et envoie ses
/// résultats à un processeur de résultats.
pub trait ProcessBlock: Send + Sync {
    /// Configure les flux du bloc. Exactement une fois par vie du bloc.
    /// `block_config` contient les flux que ce bloc possède;
    /// `overall_config` la configuration complète de la session, pour le
    /// contexte inter-pipelines.
    fn configure_streams(
        &self,
        block_config: &StreamConfiguration,
        overall_config: &StreamConfiguration,
    ) -> Result<(), SessionError>;

    /// Installe le processeur de résultats. Exactement une fois.
    fn set_result_processor(
        &self,
        result_processor: std::sync::Arc<dyn crate::result_processor::ResultProcessor>,
    ) -> Result<(), SessionError>;

    /// Flux HAL retenus par ce bloc, disponibles après `configure_streams`
    fn get_configured_hal_streams(&self) -> Result<Vec<HalStream>, SessionError>;

    /// Traite des requêtes de manière asynchrone. Avant de rendre la main,
    /// le bloc transmet `block_requests` et `remaining_session_request` à
    /// son processeur de résultats via `add_pending_requests`. Pour chaque
    /// requête acceptée, le bloc finit par produire soit un résultat
    /// couvrant chaque buffer et métadonnée attendus, soit des
    /// notifications d'erreur explicites pour ce qu'il abandonne.
    fn process_requests(
        &self,
        block_requests: &[ProcessBlockRequest],
        remaining_session_request: &CaptureRequest,
    ) -> Result<(), SessionError>;

    /// Annulation au mieux des requêtes en vol
    fn flush(&self) -> Result<(), SessionError>;
}
