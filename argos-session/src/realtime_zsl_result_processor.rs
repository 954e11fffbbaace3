use std::collections::HashMap;
use std::sync::Arc;

use log::{error, warn};
use parking_lot::Mutex;

use argos_core::metadata::tags;
use argos_core::CaptureRequest;

use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::{
    ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::result_processor::ResultProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

#[derive(Default)]
struct ModeState {
    /// Dernier mode de détection de visages demandé par le framework
    current_face_detect_mode: u8,

    /// Dernier mode de carte d'ombrage demandé par le framework
    current_lens_shading_mode: u8,

    /// Modes demandés, par trame, pour restaurer le résultat
    requested_face_detect_modes: HashMap<u32, u8>,
    requested_lens_shading_modes: HashMap<u32, u8>,
}

/// Processeur de résultats terminal de la chaîne temps réel à anneau ZSL.
///
/// Rend le buffer RAW interne rempli et sa métadonnée à l'anneau, retire le
/// RAW du résultat sortant, et efface du résultat les données de détection
/// de visages ou d'ombrage forcées pour l'usage interne quand le framework
/// les avait demandées éteintes.
pub struct RealtimeZslResultProcessor {
    internal_stream_manager: Arc<InternalStreamManager>,
    raw_stream_id: i32,
    callback: Mutex<Option<(ProcessCaptureResultFn, NotifyFn)>>,
    modes: Mutex<ModeState>,
}

impl RealtimeZslResultProcessor {
    pub fn new(internal_stream_manager: Arc<InternalStreamManager>, raw_stream_id: i32) -> Arc<Self> {
        Arc::new(Self {
            internal_stream_manager,
            raw_stream_id,
            callback: Mutex::new(None),
            modes: Mutex::new(ModeState::default()),
        })
    }

    fn save_modes(&self, request: &CaptureRequest) {
        let mut modes = self.modes.lock();
        if let Some(settings) = &request.settings {
            if let Some(mode) = settings.get_u8(tags::STATISTICS_FACE_DETECT_MODE) {
                modes.current_face_detect_mode = mode;
            }
            if let Some(mode) = settings.get_u8(tags::STATISTICS_LENS_SHADING_MAP_MODE) {
                modes.current_lens_shading_mode = mode;
            }
        }
        let face_detect_mode = modes.current_face_detect_mode;
        let lens_shading_mode = modes.current_lens_shading_mode;
        modes
            .requested_face_detect_modes
            .insert(request.frame_number, face_detect_mode);
        modes
            .requested_lens_shading_modes
            .insert(request.frame_number, lens_shading_mode);
    }
}

impl ResultProcessor for RealtimeZslResultProcessor {
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

        self.save_modes(remaining_session_request);
        Ok(())
    }

    fn process_result(&self, block_result: ProcessBlockResult) {
        let mut result = block_result.result;

        // Rendre le RAW interne rempli à l'anneau et le retirer du résultat
        let mut raw_output = false;
        let mut kept_buffers = Vec::with_capacity(result.output_buffers.len());
        for buffer in result.output_buffers.drain(..) {
            if buffer.stream_id == self.raw_stream_id {
                raw_output = true;
                if let Err(e) = self
                    .internal_stream_manager
                    .return_filled_buffer(result.frame_number, &buffer)
                {
                    warn!(
                        "Trame {}: dépôt du RAW rempli échoué: {}",
                        result.frame_number, e
                    );
                }
            } else {
                kept_buffers.push(buffer);
            }
        }
        result.output_buffers = kept_buffers;

        if let Some(metadata) = result.result_metadata.as_mut() {
            if raw_output {
                if let Err(e) = self.internal_stream_manager.return_metadata(
                    self.raw_stream_id,
                    result.frame_number,
                    metadata,
                ) {
                    warn!(
                        "Trame {}: dépôt de la métadonnée RAW échoué: {}",
                        result.frame_number, e
                    );
                }
            }

            hal_utils::set_enable_zsl_metadata(metadata, false);

            // Restaurer les modes demandés par le framework
            let mut modes = self.modes.lock();
            if modes
                .requested_face_detect_modes
                .remove(&result.frame_number)
                == Some(tags::FACE_DETECT_MODE_OFF)
            {
                hal_utils::remove_fd_info_from_result(metadata);
            }
            if modes
                .requested_lens_shading_modes
                .remove(&result.frame_number)
                == Some(tags::LENS_SHADING_MAP_MODE_OFF)
            {
                hal_utils::remove_ls_info_from_result(metadata);
            }
        }

        // Un résultat réduit au seul RAW interne ne sort pas de la chaîne
        if result.result_metadata.is_none()
            && result.output_buffers.is_empty()
            && result.input_buffers.is_empty()
        {
            return;
        }

        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((process_capture_result, _)) => process_capture_result(result),
            None => error!("Résultat ZSL perdu: rappel non installé"),
        }
    }

    fn notify(&self, block_message: ProcessBlockNotifyMessage) {
        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((_, notify)) => notify(block_message.message),
            None => warn!("Message ZSL perdu: rappel non installé"),
        }
    }

    fn flush_pending_requests(&self) -> Result<(), SessionError> {
        let mut modes = self.modes.lock();
        modes.requested_face_detect_modes.clear();
        modes.requested_lens_shading_modes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::{CaptureResult, Metadata, PixelFormat, Stream, StreamBuffer};
    use argos_hwl::SimpleBufferAllocator;
    use std::sync::mpsc;

    fn make_manager_with_raw() -> (Arc<InternalStreamManager>, i32) {
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
                &argos_core::HalStream {
                    id: raw_stream_id,
                    max_buffers: 4,
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        (manager, raw_stream_id)
    }

    #[test]
    fn test_raw_recycled_and_stripped() {
        let (manager, raw_stream_id) = make_manager_with_raw();
        let processor = RealtimeZslResultProcessor::new(manager.clone(), raw_stream_id);

        let (result_tx, result_rx) = mpsc::channel();
        processor.set_result_callback(
            Arc::new(move |result| {
                result_tx.send(result).unwrap();
            }),
            Arc::new(|_| {}),
        );

        let raw_buffer = manager.get_stream_buffer(raw_stream_id).unwrap();
        let request = CaptureRequest {
            frame_number: 11,
            settings: Some(Metadata::new()),
            output_buffers: vec![StreamBuffer {
                stream_id: 0,
                buffer_id: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        processor
            .add_pending_requests(
                &[ProcessBlockRequest {
                    request_id: 0,
                    request: CaptureRequest {
                        frame_number: 11,
                        output_buffers: vec![
                            request.output_buffers[0].clone(),
                            raw_buffer.clone(),
                        ],
                        ..Default::default()
                    },
                }],
                &request,
            )
            .unwrap();

        processor.process_result(ProcessBlockResult {
            request_id: 0,
            result: CaptureResult {
                frame_number: 11,
                result_metadata: Some(Metadata::new()),
                partial_result: 1,
                output_buffers: vec![request.output_buffers[0].clone(), raw_buffer],
                ..Default::default()
            },
        });

        let result = result_rx.recv().unwrap();
        // Le RAW interne a été retiré du résultat sortant
        assert_eq!(result.output_buffers.len(), 1);
        assert_eq!(result.output_buffers[0].stream_id, 0);
        assert_eq!(
            result
                .result_metadata
                .as_ref()
                .unwrap()
                .get_u8(tags::CONTROL_ENABLE_ZSL),
            Some(tags::ENABLE_ZSL_FALSE)
        );
    }

    #[test]
    fn test_fd_stripped_when_framework_asked_off() {
        let (manager, raw_stream_id) = make_manager_with_raw();
        let processor = RealtimeZslResultProcessor::new(manager, raw_stream_id);

        let (result_tx, result_rx) = mpsc::channel();
        processor.set_result_callback(
            Arc::new(move |result| {
                result_tx.send(result).unwrap();
            }),
            Arc::new(|_| {}),
        );

        // Le framework demande la détection éteinte
        let mut settings = Metadata::new();
        settings.set_u8(tags::STATISTICS_FACE_DETECT_MODE, tags::FACE_DETECT_MODE_OFF);
        let request = CaptureRequest {
            frame_number: 12,
            settings: Some(settings),
            output_buffers: vec![StreamBuffer {
                stream_id: 0,
                buffer_id: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        processor
            .add_pending_requests(
                &[ProcessBlockRequest {
                    request_id: 0,
                    request: request.clone(),
                }],
                &request,
            )
            .unwrap();

        // Le résultat interne porte des visages détectés
        let mut result_metadata = Metadata::new();
        result_metadata.set_u8(
            tags::STATISTICS_FACE_DETECT_MODE,
            tags::FACE_DETECT_MODE_SIMPLE,
        );
        result_metadata.set_i32(tags::STATISTICS_FACE_RECTANGLES, &[0, 0, 5, 5]);
        processor.process_result(ProcessBlockResult {
            request_id: 0,
            result: CaptureResult {
                frame_number: 12,
                result_metadata: Some(result_metadata),
                partial_result: 1,
                output_buffers: request.output_buffers.clone(),
                ..Default::default()
            },
        });

        let result = result_rx.recv().unwrap();
        let metadata = result.result_metadata.unwrap();
        assert_eq!(
            metadata.get_u8(tags::STATISTICS_FACE_DETECT_MODE),
            Some(tags::FACE_DETECT_MODE_OFF)
        );
        assert!(metadata.get(tags::STATISTICS_FACE_RECTANGLES).is_none());
    }
}
