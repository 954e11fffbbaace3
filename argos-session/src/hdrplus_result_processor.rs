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

/// Processeur de résultats terminal de la chaîne hors ligne HDR+: rend à
/// l'anneau les RAW empruntés, efface les entrées internes du résultat et
/// remet le cliché au client.
pub struct HdrplusResultProcessor {
    internal_stream_manager: Arc<InternalStreamManager>,
    raw_stream_id: i32,
    callback: Mutex<Option<(ProcessCaptureResultFn, NotifyFn)>>,
}

impl HdrplusResultProcessor {
    pub fn new(internal_stream_manager: Arc<InternalStreamManager>, raw_stream_id: i32) -> Arc<Self> {
        Arc::new(Self {
            internal_stream_manager,
            raw_stream_id,
            callback: Mutex::new(None),
        })
    }
}

impl ResultProcessor for HdrplusResultProcessor {
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

        // Les RAW empruntés retournent à l'anneau; ils ne sortent jamais
        // vers le framework
        let has_borrowed_inputs = result
            .input_buffers
            .iter()
            .any(|buffer| buffer.stream_id == self.raw_stream_id);
        if has_borrowed_inputs {
            if let Err(e) = self
                .internal_stream_manager
                .return_zsl_stream_buffers(result.frame_number, self.raw_stream_id)
            {
                warn!(
                    "Trame {}: restitution des RAW empruntés échouée: {}",
                    result.frame_number, e
                );
            }
            result
                .input_buffers
                .retain(|buffer| buffer.stream_id != self.raw_stream_id);
        }

        if let Some(metadata) = result.result_metadata.as_mut() {
            hal_utils::set_enable_zsl_metadata(metadata, false);
        }

        if result.result_metadata.is_none()
            && result.output_buffers.is_empty()
            && result.input_buffers.is_empty()
        {
            return;
        }

        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((process_capture_result, _)) => process_capture_result(result),
            None => error!("Résultat HDR+ perdu: rappel non installé"),
        }
    }

    fn notify(&self, block_message: ProcessBlockNotifyMessage) {
        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((_, notify)) => notify(block_message.message),
            None => warn!("Message HDR+ perdu: rappel non installé"),
        }
    }

    fn flush_pending_requests(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::metadata::tags;
    use argos_core::{CaptureResult, HalStream, Metadata, PixelFormat, Stream, StreamBuffer};
    use argos_hwl::SimpleBufferAllocator;
    use std::sync::mpsc;

    #[test]
    fn test_borrowed_raws_returned_to_ring() {
        let manager = InternalStreamManager::new(SimpleBufferAllocator::new());
        let raw_stream_id = manager
            .register_new_internal_stream(&Stream {
                width: 4032,
                height: 3024,
                format: PixelFormat::Raw10,
                ..Default::default()
            })
            .unwrap();
        manager
            .allocate_buffers(
                &HalStream {
                    id: raw_stream_id,
                    max_buffers: 8,
                    ..Default::default()
                },
                0,
            )
            .unwrap();

        // Remplir l'anneau puis emprunter 3 entrées
        for frame_number in 1..=4 {
            let buffer = manager.get_stream_buffer(raw_stream_id).unwrap();
            manager.return_filled_buffer(frame_number, &buffer).unwrap();
            manager
                .return_metadata(raw_stream_id, frame_number, &Metadata::new())
                .unwrap();
        }
        let (borrowed, _metadata) = manager
            .get_most_recent_stream_buffer(raw_stream_id, 3)
            .unwrap();
        assert!(!manager.is_pending_buffer_empty(raw_stream_id));

        let processor = HdrplusResultProcessor::new(manager.clone(), raw_stream_id);
        let (result_tx, result_rx) = mpsc::channel();
        processor.set_result_callback(
            Arc::new(move |result| {
                result_tx.send(result).unwrap();
            }),
            Arc::new(|_| {}),
        );

        let mut metadata = Metadata::new();
        metadata.set_u8(tags::CONTROL_ENABLE_ZSL, tags::ENABLE_ZSL_TRUE);
        processor.process_result(ProcessBlockResult {
            request_id: 0,
            result: CaptureResult {
                frame_number: 30,
                result_metadata: Some(metadata),
                partial_result: 1,
                output_buffers: vec![StreamBuffer {
                    stream_id: 1,
                    buffer_id: 9,
                    ..Default::default()
                }],
                input_buffers: borrowed,
                ..Default::default()
            },
        });

        let result = result_rx.recv().unwrap();
        // Les RAW empruntés sont désépinglés et absents du résultat
        assert!(manager.is_pending_buffer_empty(raw_stream_id));
        assert!(result.input_buffers.is_empty());
        assert_eq!(result.output_buffers.len(), 1);
        assert_eq!(
            result
                .result_metadata
                .as_ref()
                .unwrap()
                .get_u8(tags::CONTROL_ENABLE_ZSL),
            Some(tags::ENABLE_ZSL_FALSE)
        );
    }
}
