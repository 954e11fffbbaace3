use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex;

use argos_core::CaptureRequest;

use crate::hal_utils;
use crate::process_block::{
    ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::result_processor::ResultProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Processeur de résultats terminal à passage direct: vérifie la
/// couverture des buffers à l'admission et remet résultats et messages
/// tels quels.
pub struct BasicResultProcessor {
    callback: Mutex<Option<(ProcessCaptureResultFn, NotifyFn)>>,
}

impl BasicResultProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(None),
        })
    }
}

impl ResultProcessor for BasicResultProcessor {
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
        // Dernier processeur de la chaîne: chaque buffer restant doit être
        // couvert par une requête de bloc
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
        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((process_capture_result, _)) => {
                process_capture_result(block_result.result);
            }
            None => error!("Résultat perdu: rappel non installé"),
        }
    }

    fn notify(&self, block_message: ProcessBlockNotifyMessage) {
        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((_, notify)) => notify(block_message.message),
            None => warn!("Message perdu: rappel non installé"),
        }
    }

    fn flush_pending_requests(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::{CaptureResult, StreamBuffer};
    use std::sync::mpsc;

    #[test]
    fn test_admission_requires_coverage() {
        let processor = BasicResultProcessor::new();

        let remaining = CaptureRequest {
            frame_number: 1,
            output_buffers: vec![StreamBuffer {
                stream_id: 0,
                buffer_id: 4,
                ..Default::default()
            }],
            ..Default::default()
        };

        // Aucune requête de bloc ne couvre le buffer restant
        assert!(processor.add_pending_requests(&[], &remaining).is_err());

        let covering = ProcessBlockRequest {
            request_id: 0,
            request: remaining.clone(),
        };
        assert!(processor
            .add_pending_requests(&[covering], &remaining)
            .is_ok());
    }

    #[test]
    fn test_passthrough() {
        let processor = BasicResultProcessor::new();
        let (sender, receiver) = mpsc::channel();
        processor.set_result_callback(
            Arc::new(move |result| {
                sender.send(result.frame_number).unwrap();
            }),
            Arc::new(|_| {}),
        );

        processor.process_result(ProcessBlockResult {
            request_id: 0,
            result: CaptureResult {
                frame_number: 9,
                ..Default::default()
            },
        });
        assert_eq!(receiver.recv().unwrap(), 9);
    }
}
