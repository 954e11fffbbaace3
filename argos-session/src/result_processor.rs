use argos_core::CaptureRequest;

use crate::process_block::{
    ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Contrat d'un processeur de résultats. Il reçoit les résultats d'un bloc
/// de traitement et les remet aux rappels installés. Un objet implémentant à
/// la fois `ResultProcessor` et `RequestProcessor` convertit les résultats
/// en requêtes pour le bloc suivant de la chaîne.
pub trait ResultProcessor: Send + Sync {
    /// Installe les rappels de remise. À appeler avant tout résultat.
    fn set_result_callback(&self, process_capture_result: ProcessCaptureResultFn, notify: NotifyFn);

    /// Annonce les requêtes que le bloc amont va compléter.
    ///
    /// `remaining_session_request` porte tous les buffers de sortie de la
    /// requête de session pas encore complétés par la chaîne. Un processeur
    /// terminal doit vérifier que chacun est couvert par une requête de
    /// bloc, et refuser l'admission sinon.
    fn add_pending_requests(
        &self,
        block_requests: &[ProcessBlockRequest],
        remaining_session_request: &CaptureRequest,
    ) -> Result<(), SessionError>;

    /// Reçoit un résultat du bloc amont. Appelé depuis les threads du HWL.
    fn process_result(&self, block_result: ProcessBlockResult);

    /// Reçoit une notification du bloc amont. Appelé depuis les threads du
    /// HWL.
    fn notify(&self, block_message: ProcessBlockNotifyMessage);

    /// Purge le travail en attente
    fn flush_pending_requests(&self) -> Result<(), SessionError>;
}
