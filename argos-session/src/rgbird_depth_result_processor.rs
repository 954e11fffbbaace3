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

/// Processeur terminal du segment de profondeur RGB+IR+IR: recycle les
/// entrées internes, remet le seul buffer de profondeur. Les métadonnées de
/// la trame ont déjà été émises par la chaîne temps réel et ne sont jamais
/// retransmises ici.
pub struct RgbirdDepthResultProcessor {
    internal_stream_manager: Arc<InternalStreamManager>,
    callback: Mutex<Option<(ProcessCaptureResultFn, NotifyFn)>>,
}

impl RgbirdDepthResultProcessor {
    pub fn new(internal_stream_manager: Arc<InternalStreamManager>) -> Arc<Self> {
        Arc::new(Self {
            internal_stream_manager,
            callback: Mutex::new(None),
        })
    }
}

impl ResultProcessor for RgbirdDepthResultProcessor {
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

        // Les entrées internes retournent au pool
        for buffer in result.input_buffers.drain(..) {
            if let Err(e) = self.internal_stream_manager.return_stream_buffer(&buffer) {
                warn!(
                    "Trame {}: recyclage de l'entrée de profondeur échoué: {}",
                    result.frame_number, e
                );
            }
        }

        // Jamais de métadonnées depuis ce segment
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

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::{CaptureResult, Metadata, StreamBuffer};
    use argos_hwl::SimpleBufferAllocator;
    use std::sync::mpsc;

    #[test]
    fn test_inputs_recycled_metadata_dropped() {
        let manager = InternalStreamManager::new(SimpleBufferAllocator::new());
        let stream_id = manager
            .register_new_internal_stream(&argos_core::Stream {
                width: 640,
                height: 480,
                ..Default::default()
            })
            .unwrap();
        manager
            .allocate_buffers(
                &argos_core::HalStream {
                    id: stream_id,
                    max_buffers: 1,
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        let internal_buffer = manager.get_stream_buffer(stream_id).unwrap();

        let processor = RgbirdDepthResultProcessor::new(manager.clone());
        let (result_tx, result_rx) = mpsc::channel();
        processor.set_result_callback(
            Arc::new(move |result| {
                result_tx.send(result).unwrap();
            }),
            Arc::new(|_| {}),
        );

        processor.process_result(ProcessBlockResult {
            request_id: 0,
            result: CaptureResult {
                frame_number: 8,
                result_metadata: Some(Metadata::new()),
                partial_result: 1,
                output_buffers: vec![StreamBuffer {
                    stream_id: 5,
                    buffer_id: 3,
                    ..Default::default()
                }],
                input_buffers: vec![internal_buffer],
                ..Default::default()
            },
        });

        let result = result_rx.recv().unwrap();
        assert!(result.result_metadata.is_none());
        assert_eq!(result.output_buffers.len(), 1);
        assert!(result.input_buffers.is_empty());
        // L'entrée interne est revenue au pool
        assert!(manager.get_stream_buffer(stream_id).is_ok());
    }
}
