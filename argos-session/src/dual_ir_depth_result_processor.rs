use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex;

use argos_core::CaptureRequest;

use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::{
    ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::result_processor::ResultProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Processeur terminal du segment de profondeur double infrarouge. Même
/// contrat que son homologue RGB+IR+IR: recycler les entrées, remettre la
/// profondeur seule, jamais de métadonnées.
pub struct DualIrDepthResultProcessor {
    internal_stream_manager: Arc<InternalStreamManager>,
    callback: Mutex<Option<(ProcessCaptureResultFn, NotifyFn)>>,
}

impl DualIrDepthResultProcessor {
    pub fn new(internal_stream_manager: Arc<InternalStreamManager>) -> Arc<Self> {
        Arc::new(Self {
            internal_stream_manager,
            callback: Mutex::new(None),
        })
    }
}

impl ResultProcessor for DualIrDepthResultProcessor {
    fn set_result_callback(
        &self,
        process_capture_result: ProcessCaptureResultFn,
        notify: NotifyFn,
    ) {
        *self.callback.lock() = Some((process_capture_result, notify));
    }

    fn add_pending_requests(
        &self,
        block_requests: &[ProcessBlockRequest],
        remaining_session_request: &CaptureRequest,
    ) -> Result<(), SessionError> {
        if !hal_utils::are_all_remaining_buffers_requested(
            block_requests,
            remaining_session_request,
        ) {
            return Err(SessionError::BadValue(format!(
                "Trame {}: des buffers de sortie ne seraient jamais complétés",
                remaining_session_request.frame_number
            )));
        }
        Ok(())
    }

    fn process_result(&self, block_result: ProcessBlockResult) {
        let mut result = block_result.result;

        for buffer in result.input_buffers.drain(..) {
            if let Err(e) = self.internal_stream_manager.return_stream_buffer(&buffer) {
                warn!(
                    "Trame {}: recyclage de l'entrée de profondeur échoué: {}",
                    result.frame_number, e
                );
            }
        }

        result.result_metadata = None;
        result.physical_metadata.clear();

        if result.output_buffers.is_empty() {
            return;
        }

        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((process_capture_result, _)) => process_capture_result(result),
            None => error!("Résultat de profondeur perdu: rappel non installé"),
        }
    }

    fn notify(&self, block_message: ProcessBlockNotifyMessage) {
        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((_, notify)) => notify(block_message.message),
            None => warn!("Message de profondeur perdu: rappel non installé"),
        }
    }

    fn flush_pending_requests(&self) -> Result<(), SessionError> {
        Ok(())
    }
}
