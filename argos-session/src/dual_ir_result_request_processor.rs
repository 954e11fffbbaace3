use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;

use argos_core::metadata::tags;
use argos_core::stream::INVALID_STREAM_ID;
use argos_core::{
    CaptureRequest, CaptureResult, ErrorCode, Metadata, MetadataValue, NotifyMessage,
    StreamBuffer, StreamConfiguration, StreamType,
};

use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::{
    ProcessBlock, ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::request_processor::RequestProcessor;
use crate::result_processor::ResultProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

#[derive(Default)]
struct PendingResultMetadata {
    /// Métadonnées logiques, clone de celles de la caméra meneuse
    logical: Option<Metadata>,

    /// Une entrée par caméra physique attendue
    physical: BTreeMap<u32, Option<Metadata>>,
}

#[derive(Default)]
struct DepthAssembly {
    ir_buffers: [Option<StreamBuffer>; 2],
    lead_metadata: Option<Metadata>,
    depth_output: Option<StreamBuffer>,
    settings: Option<Metadata>,
    submitted: bool,
}

impl DepthAssembly {
    fn is_complete(&self) -> bool {
        !self.submitted
            && self.ir_buffers[0].is_some()
            && self.ir_buffers[1].is_some()
            && self.lead_metadata.is_some()
            && self.depth_output.is_some()
    }
}

/// Processeur de résultats du dispositif double infrarouge, et processeur
/// de requêtes du segment de profondeur aval.
///
/// Agrège les métadonnées par caméra physique en un unique résultat logique
/// étiqueté avec la caméra meneuse comme identifiant physique actif, émis
/// seulement quand la métadonnée logique et chaque métadonnée physique
/// attendue sont arrivées. Seule l'obturation de la caméra meneuse est
/// transmise.
pub struct DualIrResultRequestProcessor {
    logical_camera_id: u32,
    lead_camera_id: u32,
    ir_camera_ids: [u32; 2],

    /// Flux du framework → caméra (logique ou physique)
    stream_camera_ids: HashMap<i32, u32>,

    /// Flux Y8 internes du segment de profondeur, si configuré
    internal_ir_stream_ids: Option<[i32; 2]>,

    internal_stream_manager: Arc<InternalStreamManager>,
    callback: Mutex<Option<(ProcessCaptureResultFn, NotifyFn)>>,
    pending_result_metadata: Mutex<HashMap<u32, PendingResultMetadata>>,
    depth_stream_id: Mutex<i32>,
    depth_requests: Mutex<HashMap<u32, DepthAssembly>>,
    depth_block: Mutex<Option<Box<dyn ProcessBlock>>>,
}

impl DualIrResultRequestProcessor {
    pub fn new(
        stream_config: &StreamConfiguration,
        logical_camera_id: u32,
        lead_camera_id: u32,
        ir_camera_ids: [u32; 2],
        internal_ir_stream_ids: Option<[i32; 2]>,
        internal_stream_manager: Arc<InternalStreamManager>,
    ) -> Arc<Self> {
        // Correspondance flux → caméra d'après la configuration du framework
        let mut stream_camera_ids = HashMap::new();
        for stream in &stream_config.streams {
            let camera_id = if stream.is_physical_camera_stream {
                stream.physical_camera_id
            } else {
                logical_camera_id
            };
            stream_camera_ids.insert(stream.id, camera_id);
        }

        Arc::new(Self {
            logical_camera_id,
            lead_camera_id,
            ir_camera_ids,
            stream_camera_ids,
            internal_ir_stream_ids,
            internal_stream_manager,
            callback: Mutex::new(None),
            pending_result_metadata: Mutex::new(HashMap::new()),
            depth_stream_id: Mutex::new(INVALID_STREAM_ID),
            depth_requests: Mutex::new(HashMap::new()),
            depth_block: Mutex::new(None),
        })
    }

    fn is_internal_stream(&self, stream_id: i32) -> bool {
        self.internal_ir_stream_ids
            .map(|ids| ids.contains(&stream_id))
            .unwrap_or(false)
    }

    /// Caméra physique d'un flux du framework, None pour un flux logique
    fn framework_physical_camera(&self, stream_id: i32) -> Option<u32> {
        match self.stream_camera_ids.get(&stream_id) {
            Some(camera_id) if *camera_id != self.logical_camera_id => Some(*camera_id),
            _ => None,
        }
    }

    fn try_send_result_metadata(&self, frame_number: u32) {
        let result = {
            let mut pending = self.pending_result_metadata.lock();
            let entry = match pending.get(&frame_number) {
                Some(entry) => entry,
                None => return,
            };

            if entry.logical.is_none() {
                return;
            }
            if entry.physical.values().any(|metadata| metadata.is_none()) {
                return;
            }

            let entry = pending.remove(&frame_number).unwrap();
            CaptureResult {
                frame_number,
                result_metadata: entry.logical,
                partial_result: crate::PARTIAL_RESULT_COUNT,
                physical_metadata: entry
                    .physical
                    .into_iter()
                    .map(|(camera_id, metadata)| (camera_id, metadata.unwrap()))
                    .collect(),
                ..Default::default()
            }
        };

        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((process_capture_result, _)) => process_capture_result(result),
            None => error!("Métadonnées logiques perdues: rappel non installé"),
        }
    }

    fn process_result_metadata(
        &self,
        frame_number: u32,
        camera_id: u32,
        mut result_metadata: Metadata,
    ) {
        // Conserver la métadonnée de la caméra meneuse pour le segment de
        // profondeur
        if camera_id == self.lead_camera_id {
            let mut depth_requests = self.depth_requests.lock();
            if let Some(assembly) = depth_requests.get_mut(&frame_number) {
                assembly.lead_metadata = Some(result_metadata.clone());
            }
        }

        let mut pending = self.pending_result_metadata.lock();
        let entry = match pending.get_mut(&frame_number) {
            Some(entry) => entry,
            None => {
                warn!("Métadonnées pour une trame inattendue: {}", frame_number);
                return;
            }
        };

        if camera_id == self.lead_camera_id {
            if entry.logical.is_some() {
                warn!(
                    "Métadonnées logiques dupliquées pour la trame {}",
                    frame_number
                );
                return;
            }

            // La caméra meneuse devient l'identifiant physique actif du
            // résultat logique
            let active_physical_id = self.lead_camera_id.to_string();
            result_metadata.set(
                tags::LOGICAL_MULTI_CAMERA_ACTIVE_PHYSICAL_ID,
                MetadataValue::Byte(active_physical_id.into_bytes()),
            );

            if let Some(slot) = entry.physical.get_mut(&camera_id) {
                *slot = Some(result_metadata.clone());
            }
            entry.logical = Some(result_metadata);
        } else if let Some(slot) = entry.physical.get_mut(&camera_id) {
            if slot.is_some() {
                warn!(
                    "Métadonnées physiques dupliquées: caméra {} trame {}",
                    camera_id, frame_number
                );
                return;
            }
            *slot = Some(result_metadata);
        }

        drop(pending);
        self.try_send_result_metadata(frame_number);
    }

    fn try_submit_depth_request(&self, frame_number: u32) {
        let block_request = {
            let mut depth_requests = self.depth_requests.lock();
            let assembly = match depth_requests.get_mut(&frame_number) {
                Some(assembly) if assembly.is_complete() => assembly,
                _ => return,
            };
            assembly.submitted = true;

            ProcessBlockRequest {
                request_id: 0,
                request: CaptureRequest {
                    frame_number,
                    settings: assembly.settings.clone(),
                    input_buffers: vec![
                        assembly.ir_buffers[0].clone().unwrap(),
                        assembly.ir_buffers[1].clone().unwrap(),
                    ],
                    input_buffer_metadata: vec![assembly.lead_metadata.clone(), None],
                    output_buffers: vec![assembly.depth_output.clone().unwrap()],
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
            None => error!(
                "Bloc de profondeur absent, trame {} sans profondeur",
                frame_number
            ),
        }
        self.depth_requests.lock().remove(&frame_number);
    }
}

impl ResultProcessor for DualIrResultRequestProcessor {
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

        // Métadonnées physiques attendues: une par caméra ayant un flux
        // physique du framework dans la trame
        let mut entry = PendingResultMetadata::default();
        for block_request in block_requests {
            for buffer in &block_request.request.output_buffers {
                if let Some(camera_id) = self.framework_physical_camera(buffer.stream_id) {
                    entry.physical.entry(camera_id).or_insert(None);
                }
            }
        }
        self.pending_result_metadata
            .lock()
            .insert(remaining_session_request.frame_number, entry);

        // Assemblage de profondeur si la trame en demande
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

        // Capturer les buffers infrarouges internes pour la profondeur
        if let Some(internal_ids) = self.internal_ir_stream_ids {
            let mut kept = Vec::with_capacity(result.output_buffers.len());
            let mut depth_requests = self.depth_requests.lock();
            for buffer in result.output_buffers.drain(..) {
                if !internal_ids.contains(&buffer.stream_id) {
                    kept.push(buffer);
                    continue;
                }
                match depth_requests.get_mut(&frame_number) {
                    Some(assembly) => {
                        let index = if buffer.stream_id == internal_ids[0] { 0 } else { 1 };
                        assembly.ir_buffers[index] = Some(buffer);
                    }
                    None => {
                        if let Err(e) =
                            self.internal_stream_manager.return_stream_buffer(&buffer)
                        {
                            warn!(
                                "Trame {}: recyclage du buffer infrarouge échoué: {}",
                                frame_number, e
                            );
                        }
                    }
                }
            }
            result.output_buffers = kept;
        }

        if let Some(result_metadata) = result.result_metadata.take() {
            self.process_result_metadata(frame_number, camera_id, result_metadata);
        }

        self.try_submit_depth_request(frame_number);

        if result.output_buffers.is_empty() && result.input_buffers.is_empty() {
            return;
        }

        let callback = self.callback.lock();
        match callback.as_ref() {
            Some((process_capture_result, _)) => process_capture_result(result),
            None => error!("Résultat double infrarouge perdu: rappel non installé"),
        }
    }

    fn notify(&self, block_message: ProcessBlockNotifyMessage) {
        let camera_id = block_message.request_id;
        match &block_message.message {
            NotifyMessage::Shutter(_) => {
                // Une seule obturation par trame: celle de la caméra meneuse
                if camera_id != self.lead_camera_id {
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
            None => warn!("Message double infrarouge perdu: rappel non installé"),
        }
    }

    fn flush_pending_requests(&self) -> Result<(), SessionError> {
        self.pending_result_metadata.lock().clear();
        let mut depth_requests = self.depth_requests.lock();
        for (frame_number, assembly) in depth_requests.drain() {
            for buffer in assembly.ir_buffers.into_iter().flatten() {
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

impl RequestProcessor for DualIrResultRequestProcessor {
    /// Configure le segment de profondeur aval: la profondeur du framework
    /// en sortie, les deux Y8 internes en entrées
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
        let internal_ids = self.internal_ir_stream_ids.ok_or_else(|| {
            SessionError::NoInit("Flux infrarouges internes absents".to_string())
        })?;

        *self.depth_stream_id.lock() = depth_stream.id;

        let mut block_config = StreamConfiguration {
            streams: vec![depth_stream],
            operation_mode: stream_config.operation_mode,
            session_params: stream_config.session_params.clone(),
            stream_config_counter: stream_config.stream_config_counter,
        };
        for (index, stream_id) in internal_ids.into_iter().enumerate() {
            block_config.streams.push(argos_core::Stream {
                id: stream_id,
                stream_type: StreamType::Input,
                width: 640,
                height: 480,
                format: argos_core::PixelFormat::Y8,
                is_physical_camera_stream: true,
                physical_camera_id: self.ir_camera_ids[index],
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
