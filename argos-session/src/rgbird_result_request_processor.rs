use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use argos_core::stream::INVALID_STREAM_ID;
use argos_core::{
    CaptureRequest, ErrorCode, Metadata, NotifyMessage, StreamBuffer, StreamConfiguration,
    StreamType,
};

use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::{
    ProcessBlock, ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::request_processor::RequestProcessor;
use crate::result_processor::ResultProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Identifiants des flux internes de la chaîne temps réel RGB+IR+IR
#[derive(Debug, Clone, Copy)]
pub struct RgbirdInternalStreams {
    /// YUV de synchronisation, produit par la caméra RGB
    pub rgb_yuv_stream_id: i32,

    /// Y8 des deux caméras infrarouges
    pub ir_stream_ids: [i32; 2],

    /// Anneau RAW HDR+ de la caméra RGB, si supporté
    pub rgb_raw_stream_id: Option<i32>,
}

/// Assemblage en cours d'une requête de profondeur pour une trame
#[derive(Default)]
struct PendingDepthAssembly {
    yuv_buffer: Option<StreamBuffer>,
    ir_buffers: [Option<StreamBuffer>; 2],
    rgb_metadata: Option<Metadata>,
    depth_output: Option<StreamBuffer>,
    settings: Option<Metadata>,
    submitted: bool,
}

impl PendingDepthAssembly {
    fn is_complete(&self) -> bool {
        !self.submitted
            && self.yuv_buffer.is_some()
            && self.ir_buffers[0].is_some()
            && self.ir_buffers[1].is_some()
            && self.rgb_metadata.is_some()
            && self.depth_output.is_some()
    }
}

/// Processeur de résultats de la chaîne temps réel RGB+IR+IR, qui est aussi
/// le processeur de requêtes du segment de profondeur aval.
///
/// Pour chaque trame de profondeur, suit l'arrivée de la métadonnée RGB, du
/// YUV de synchronisation et des deux buffers infrarouges, puis assemble et
/// soumet la requête du bloc de profondeur. Supprime les obturations des
/// caméras non meneuses et avale les erreurs de buffer des flux internes.
pub struct RgbirdResultRequestProcessor {
    rgb_camera_id: u32,
    internal_streams: RgbirdInternalStreams,
    internal_stream_manager: Arc<InternalStreamManager>,
    is_hdrplus_supported: bool,
    callback: Mutex<Option<(ProcessCaptureResultFn, NotifyFn)>>,
    depth_stream_id: Mutex<i32>,
    depth_requests: Mutex<HashMap<u32, PendingDepthAssembly>>,
    depth_block: Mutex<Option<Box<dyn ProcessBlock>>>,
}

impl RgbirdResultRequestProcessor {
    pub fn new(
        rgb_camera_id: u32,
        internal_streams: RgbirdInternalStreams,
        internal_stream_manager: Arc<InternalStreamManager>,
        is_hdrplus_supported: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            rgb_camera_id,
            internal_streams,
            internal_stream_manager,
            is_hdrplus_supported,
            callback: Mutex::new(None),
            depth_stream_id: Mutex::new(INVALID_STREAM_ID),
            depth_requests: Mutex::new(HashMap::new()),
            depth_block: Mutex::new(None),
        })
    }

    fn is_internal_stream(&self, stream_id: i32) -> bool {
        stream_id == self.internal_streams.rgb_yuv_stream_id
            || self.internal_streams.ir_stream_ids.contains(&stream_id)
            || self.internal_streams.rgb_raw_stream_id == Some(stream_id)
    }

    /// Rend le RAW HDR+ rempli et sa métadonnée à l'anneau, et le retire du
    /// résultat
    fn process_result_for_hdrplus(&self, result: &mut argos_core::CaptureResult) -> bool {
        let raw_stream_id = match self.internal_streams.rgb_raw_stream_id {
            Some(raw_stream_id) => raw_stream_id,
            None => return false,
        };

        let mut raw_output = false;
        let mut kept = Vec::with_capacity(result.output_buffers.len());
        for buffer in result.output_buffers.drain(..) {
            if buffer.stream_id == raw_stream_id {
                raw_output = true;
                if let Err(e) = self
                    .internal_stream_manager
                    .return_filled_buffer(result.frame_number, &buffer)
                {
                    warn!(
                        "Trame {}: dépôt du RAW HDR+ échoué: {}",
                        result.frame_number, e
                    );
                }
            } else {
                kept.push(buffer);
            }
        }
        result.output_buffers = kept;

        if raw_output {
            if let Some(metadata) = &result.result_metadata {
                if let Err(e) = self.internal_stream_manager.return_metadata(
                    raw_stream_id,
                    result.frame_number,
                    metadata,
                ) {
                    warn!(
                        "Trame {}: dépôt de la métadonnée RAW HDR+ échoué: {}",
                        result.frame_number, e
                    );
                }
            }
        }
        raw_output
    }

    /// Capture les buffers internes du résultat pour l'assemblage de
    /// profondeur, ou les recycle si la trame n'en attend pas
    fn collect_internal_buffers(
        &self,
        frame_number: u32,
        result: &mut argos_core::CaptureResult,
    ) -> bool {
        let mut has_internal = false;
        let mut kept = Vec::with_capacity(result.output_buffers.len());
        let mut depth_requests = self.depth_requests.lock();

        for buffer in result.output_buffers.drain(..) {
            if !self.is_internal_stream(buffer.stream_id) {
                kept.push(buffer);
                continue;
            }
            has_internal = true;

            let assembly = depth_requests.get_mut(&frame_number);
            match assembly {
                Some(assembly) => {
                    if buffer.stream_id == self.internal_streams.rgb_yuv_stream_id {
                        assembly.yuv_buffer = Some(buffer);
                    } else if buffer.stream_id == self.internal_streams.ir_stream_ids[0] {
                        assembly.ir_buffers[0] = Some(buffer);
                    } else if buffer.stream_id == self.internal_streams.ir_stream_ids[1] {
                        assembly.ir_buffers[1] = Some(buffer);
                    }
                }
                None => {
                    // Trame sans profondeur: le buffer retourne au pool
                    if let Err(e) = self.internal_stream_manager.return_stream_buffer(&buffer) {
                        warn!(
                            "Trame {}: recyclage du buffer interne {} échoué: {}",
                            frame_number, buffer.stream_id, e
                        );
                    }
                }
            }
        }
        result.output_buffers = kept;
        has_internal
    }

    fn try_submit_depth_request(&self, frame_number: u32) {
        let block_request = {
            let mut depth_requests = self.depth_requests.lock();
            let assembly = match depth_requests.get_mut(&frame_number) {
                Some(assembly) if assembly.is_complete() => assembly,
                _ => return,
            };
            assembly.submitted = true;

            let yuv = assembly.yuv_buffer.clone().unwrap();
            let ir1 = assembly.ir_buffers[0].clone().unwrap();
            let ir2 = assembly.ir_buffers[1].clone().unwrap();
            let rgb_metadata = assembly.rgb_metadata.clone();
            let depth_output = assembly.depth_output.clone().unwrap();

            ProcessBlockRequest {
                request_id: 0,
                request: CaptureRequest {
                    frame_number,
                    settings: assembly.settings.clone(),
                    input_buffers: vec![yuv, ir1, ir2],
                    input_buffer_metadata: vec![rgb_metadata, None, None],
                    output_buffers: vec![depth_output],
                    ..Default::default()
                },
            }
        };

        let remaining = CaptureRequest {
            frame_number,
            output_buffers: block_request.request.output_buffers.clone(),
            ..Default::default()
        };

        let depth_block = self.depth_block.lock();
        match depth_block.as_ref() {
            Some(depth_block) => {
                debug!("Trame {}: requête de profondeur soumise", frame_number);
                if let Err(e) =
                    depth_block.process_requests(std::slice::from_ref(&block_request), &remaining)
                {
                    error!(
                        "Trame {}: soumission de la profondeur échouée: {}",
                        frame_number, e
                    );
                }
            }
            None => error!("Bloc de profondeur absent, trame {} sans profondeur", frame_number),
        }
        self.depth_requests.lock().remove(&frame_number);
    }
}

impl ResultProcessor for RgbirdResultRequestProcessor {
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
        let depth_stream_id = *self.depth_stream_id.lock();

        // Tout buffer restant hors profondeur doit être couvert par la
        // chaîne temps réel; la profondeur sera complétée par le segment aval
        let non_depth_remaining = CaptureRequest {
            frame_number: remaining_session_request.frame_number,
            output_buffers: remaining_session_request
                .output_buffers
                .iter()
                .filter(|buffer| buffer.stream_id != depth_stream_id)
                .cloned()
                .collect(),
            ..Default::default()
        };
        if !hal_utils::are_all_remaining_buffers_requested(block_requests, &non_depth_remaining) {
            return Err(SessionError::BadValue(format!(
                "Trame {}: des buffers de sortie ne seraient jamais complétés",
                remaining_session_request.frame_number
            )));
        }

        // Préparer l'assemblage si la trame porte une sortie de profondeur
        let depth_output = remaining_session_request
            .output_buffers
            .iter()
            .find(|buffer| buffer.stream_id == depth_stream_id);
        if let Some(depth_output) = depth_output {
            let mut depth_requests = self.depth_requests.lock();
            let assembly = depth_requests
                .entry(remaining_session_request.frame_number)
                .or_default();
            assembly.depth_output = Some(depth_output.clone());
            assembly.settings = remaining_session_request.settings.clone();
        }

        Ok(())
    }

    fn process_result(&self, block_result: ProcessBlockResult) {
        let mut result = block_result.result;
        let frame_number = result.frame_number;
        // L'identifiant de requête porte la caméra émettrice
        let camera_id = block_result.request_id;

        let mut has_internal = false;
        if self.is_hdrplus_supported && camera_id == self.rgb_camera_id {
            has_internal |= self.process_result_for_hdrplus(&mut result);
        }
        has_internal |= self.collect_internal_buffers(frame_number, &mut result);

        if camera_id == self.rgb_camera_id {
            if let Some(metadata) = &result.result_metadata {
                let mut depth_requests = self.depth_requests.lock();
                if let Some(assembly) = depth_requests.get_mut(&frame_number) {
                    assembly.rgb_metadata = Some(metadata.clone());
                }
            }
        }

        self.try_submit_depth_request(frame_number);

        // Les résultats des caméras infrarouges ne portent que des flux
        // internes; seule la caméra RGB parle au framework
        if camera_id != self.rgb_camera_id {
            if result.result_metadata.is_some() || !result.output_buffers.is_empty() {
                debug!(
                    "Trame {}: résultat infrarouge non transmis (caméra {})",
                    frame_number, camera_id
                );
            }
            return;
        }

        if let Some(metadata) = result.result_metadata.as_mut() {
            hal_utils::set_enable_zsl_metadata(metadata, false);
        }

        if has_internal
            && result.result_metadata.is_none()
            && result.output_buffers.is_empty()
            && result.input_buffers.is_empty()
        {
            return;
        }

        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((process_capture_result, _)) => process_capture_result(result),
            None => error!("Résultat RGB+IR perdu: rappel non installé"),
        }
    }

    fn notify(&self, block_message: ProcessBlockNotifyMessage) {
        let camera_id = block_message.request_id;
        match &block_message.message {
            NotifyMessage::Shutter(_) => {
                // Une seule obturation par trame: celle de la caméra meneuse
                if camera_id != self.rgb_camera_id {
                    return;
                }
            }
            NotifyMessage::Error(error) => {
                if error.error_code == ErrorCode::Buffer {
                    if let Some(stream_id) = error.error_stream_id {
                        if self.is_internal_stream(stream_id) {
                            debug!(
                                "Trame {}: erreur de buffer interne avalée (flux {})",
                                error.frame_number, stream_id
                            );
                            return;
                        }
                    }
                }
            }
        }

        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((_, notify)) => notify(block_message.message),
            None => warn!("Message RGB+IR perdu: rappel non installé"),
        }
    }

    fn flush_pending_requests(&self) -> Result<(), SessionError> {
        // Recycler les buffers internes des assemblages abandonnés
        let mut depth_requests = self.depth_requests.lock();
        for (frame_number, assembly) in depth_requests.drain() {
            let buffers = assembly
                .yuv_buffer
                .into_iter()
                .chain(assembly.ir_buffers.into_iter().flatten());
            for buffer in buffers {
                if let Err(e) = self.internal_stream_manager.return_stream_buffer(&buffer) {
                    warn!(
                        "Trame {}: recyclage au vidage échoué: {}",
                        frame_number, e
                    );
                }
            }
        }
        Ok(())
    }
}

impl RequestProcessor for RgbirdResultRequestProcessor {
    /// Configure le segment de profondeur: le flux de profondeur du
    /// framework devient la sortie du bloc aval, les flux internes YUV et
    /// infrarouges deviennent ses entrées.
    fn configure_streams(
        &self,
        _internal_stream_manager: &Arc<InternalStreamManager>,
        stream_config: &StreamConfiguration,
    ) -> Result<StreamConfiguration, SessionError> {
        let depth_stream = stream_config
            .streams
            .iter()
            .find(|stream| hal_utils::is_depth_stream(stream))
            .cloned()
            .ok_or_else(|| {
                SessionError::BadValue(
                    "Configuration du segment de profondeur sans flux de profondeur".to_string(),
                )
            })?;
        *self.depth_stream_id.lock() = depth_stream.id;
        info!(
            "Segment de profondeur configuré sur le flux {}",
            depth_stream.id
        );

        let mut block_config = StreamConfiguration {
            streams: vec![depth_stream],
            operation_mode: stream_config.operation_mode,
            session_params: stream_config.session_params.clone(),
            stream_config_counter: stream_config.stream_config_counter,
        };

        // Les flux internes du segment temps réel, retournés en entrées
        let mut yuv_stream = argos_core::Stream {
            id: self.internal_streams.rgb_yuv_stream_id,
            stream_type: StreamType::Input,
            format: argos_core::PixelFormat::Ycbcr420_888,
            width: 640,
            height: 480,
            ..Default::default()
        };
        yuv_stream.is_physical_camera_stream = true;
        yuv_stream.physical_camera_id = self.rgb_camera_id;
        block_config.streams.push(yuv_stream);

        for ir_stream_id in self.internal_streams.ir_stream_ids {
            block_config.streams.push(argos_core::Stream {
                id: ir_stream_id,
                stream_type: StreamType::Input,
                format: argos_core::PixelFormat::Y8,
                width: 640,
                height: 480,
                ..Default::default()
            });
        }

        Ok(block_config)
    }

    fn set_process_block(&self, process_block: Box<dyn ProcessBlock>) -> Result<(), SessionError> {
        let mut slot = self.depth_block.lock();
        if slot.is_some() {
            return Err(SessionError::AlreadyExists(
                "Bloc de profondeur déjà installé".to_string(),
            ));
        }
        *slot = Some(process_block);
        Ok(())
    }

    fn process_request(&self, request: &CaptureRequest) -> Result<(), SessionError> {
        // Les requêtes de profondeur naissent des résultats temps réel,
        // jamais d'une soumission directe
        Err(SessionError::BadValue(format!(
            "Trame {}: soumission directe non supportée",
            request.frame_number
        )))
    }

    fn flush(&self) -> Result<(), SessionError> {
        if let Some(depth_block) = self.depth_block.lock().as_ref() {
            depth_block.flush()?;
        }
        self.flush_pending_requests()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::{BufferStatus, CaptureResult, ErrorMessage, ShutterMessage};
    use argos_hwl::SimpleBufferAllocator;
    use std::sync::mpsc;

    fn make_processor() -> (Arc<RgbirdResultRequestProcessor>, Arc<InternalStreamManager>) {
        let manager = InternalStreamManager::new(SimpleBufferAllocator::new());
        let streams = RgbirdInternalStreams {
            rgb_yuv_stream_id: 70_000,
            ir_stream_ids: [70_001, 70_002],
            rgb_raw_stream_id: None,
        };
        let processor = RgbirdResultRequestProcessor::new(1, streams, manager.clone(), false);
        (processor, manager)
    }

    #[test]
    fn test_shutter_suppressed_for_non_lead() {
        let (processor, _manager) = make_processor();
        let (notify_tx, notify_rx) = mpsc::channel();
        processor.set_result_callback(
            Arc::new(|_| {}),
            Arc::new(move |message| {
                notify_tx.send(message).unwrap();
            }),
        );

        let shutter = NotifyMessage::Shutter(ShutterMessage {
            frame_number: 1,
            timestamp_ns: 100,
        });

        // Caméra infrarouge (2): supprimée
        processor.notify(ProcessBlockNotifyMessage {
            request_id: 2,
            message: shutter,
        });
        assert!(notify_rx.try_recv().is_err());

        // Caméra meneuse (1): transmise
        processor.notify(ProcessBlockNotifyMessage {
            request_id: 1,
            message: shutter,
        });
        assert!(notify_rx.recv().is_ok());
    }

    #[test]
    fn test_internal_buffer_error_swallowed() {
        let (processor, _manager) = make_processor();
        let (notify_tx, notify_rx) = mpsc::channel();
        processor.set_result_callback(
            Arc::new(|_| {}),
            Arc::new(move |message| {
                notify_tx.send(message).unwrap();
            }),
        );

        processor.notify(ProcessBlockNotifyMessage {
            request_id: 1,
            message: NotifyMessage::Error(ErrorMessage {
                frame_number: 2,
                error_stream_id: Some(70_001),
                error_code: ErrorCode::Buffer,
            }),
        });
        assert!(notify_rx.try_recv().is_err());

        // Erreur sur un flux du framework: transmise
        processor.notify(ProcessBlockNotifyMessage {
            request_id: 1,
            message: NotifyMessage::Error(ErrorMessage {
                frame_number: 2,
                error_stream_id: Some(0),
                error_code: ErrorCode::Buffer,
            }),
        });
        assert!(notify_rx.recv().is_ok());
    }

    #[test]
    fn test_internal_buffers_recycled_without_depth() {
        let (processor, manager) = make_processor();
        processor.set_result_callback(Arc::new(|_| {}), Arc::new(|_| {}));

        // Enregistrer et allouer le flux YUV interne pour vérifier le recyclage
        let yuv_id = manager
            .register_new_internal_stream(&argos_core::Stream {
                id: 70_000 - 4_096,
                width: 640,
                height: 480,
                format: argos_core::PixelFormat::Ycbcr420_888,
                ..Default::default()
            })
            .unwrap();
        manager
            .allocate_buffers(
                &argos_core::HalStream {
                    id: yuv_id,
                    max_buffers: 1,
                    ..Default::default()
                },
                0,
            )
            .unwrap();
        let yuv_buffer = manager.get_stream_buffer(yuv_id).unwrap();
        assert!(manager.get_stream_buffer(yuv_id).is_err());

        // Processeur reconstruit avec le bon identifiant YUV
        let streams = RgbirdInternalStreams {
            rgb_yuv_stream_id: yuv_id,
            ir_stream_ids: [70_001, 70_002],
            rgb_raw_stream_id: None,
        };
        let processor = RgbirdResultRequestProcessor::new(1, streams, manager.clone(), false);
        processor.set_result_callback(Arc::new(|_| {}), Arc::new(|_| {}));

        // Résultat portant le YUV interne, sans assemblage de profondeur
        processor.process_result(ProcessBlockResult {
            request_id: 1,
            result: CaptureResult {
                frame_number: 3,
                output_buffers: vec![StreamBuffer {
                    status: BufferStatus::Ok,
                    ..yuv_buffer
                }],
                ..Default::default()
            },
        });

        // Le buffer est revenu au pool
        assert!(manager.get_stream_buffer(yuv_id).is_ok());
        drop(processor);
    }
}
