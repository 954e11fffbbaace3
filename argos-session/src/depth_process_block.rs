use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use argos_core::metadata::tags;
use argos_core::stream::usage;
use argos_core::{
    BufferStatus, CaptureRequest, CaptureResult, ErrorCode, ErrorMessage, HalStream, Metadata,
    NotifyMessage, PixelFormat, Stream, StreamConfiguration,
};
use argos_hwl::{
    DepthBuffer, DepthGenerator, DepthRequestInfo, DepthResultStatus, DeviceSessionHwl,
    PlaneLayout,
};

use crate::hal_utils;
use crate::process_block::{
    ProcessBlock, ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::result_processor::ResultProcessor;
use crate::SessionError;

struct DepthConfig {
    hal_streams: Vec<HalStream>,
    streams: HashMap<i32, Stream>,
    depth_stream_id: i32,
}

struct PendingDepth {
    depth_buffer: argos_core::StreamBuffer,
    input_buffers: Vec<argos_core::StreamBuffer>,
}

struct DepthCore {
    generator: Arc<dyn DepthGenerator>,
    result_processor: Mutex<Option<Arc<dyn ResultProcessor>>>,
    configured: RwLock<Option<DepthConfig>>,
    pending: Mutex<HashMap<u32, PendingDepth>>,
}

impl DepthCore {
    /// Clôt une trame: remet le buffer de profondeur (ok ou en erreur) et
    /// restitue les entrées au processeur de résultats
    fn complete_frame(&self, frame_number: u32, status: DepthResultStatus) {
        let pending = self.pending.lock().remove(&frame_number);
        let pending = match pending {
            Some(pending) => pending,
            None => {
                warn!("Complétion de profondeur pour une trame inconnue: {}", frame_number);
                return;
            }
        };

        let result_processor = self.result_processor.lock().clone();
        let result_processor = match result_processor {
            Some(result_processor) => result_processor,
            None => {
                error!("Résultat de profondeur sans processeur de résultats");
                return;
            }
        };

        let mut depth_buffer = pending.depth_buffer;
        if status == DepthResultStatus::Error {
            depth_buffer.status = BufferStatus::Error;
            result_processor.notify(ProcessBlockNotifyMessage {
                request_id: 0,
                message: NotifyMessage::Error(ErrorMessage {
                    frame_number,
                    error_stream_id: Some(depth_buffer.stream_id),
                    error_code: ErrorCode::Buffer,
                }),
            });
        }

        result_processor.process_result(ProcessBlockResult {
            request_id: 0,
            result: CaptureResult {
                frame_number,
                result_metadata: None,
                partial_result: 0,
                output_buffers: vec![depth_buffer],
                input_buffers: pending.input_buffers,
                physical_metadata: Default::default(),
            },
        });
    }
}

/// Bloc hors ligne de génération de profondeur: projette les buffers
/// d'entrée (YUV couleur optionnel, deux sources Y8 infrarouges) et la
/// sortie profondeur dans le modèle mémoire du greffon générateur, puis
/// reçoit la complétion sur un thread séparé ou en synchrone selon le mode.
pub struct DepthProcessBlock {
    core: Arc<DepthCore>,

    /// Vrai: dépôt asynchrone avec rappel; faux: exécution bloquante
    async_mode: bool,

    /// Rapport matrice active infrarouge / matrice active logique, appliqué
    /// à la région de recadrage avant soumission
    ir_active_array_ratio: f32,
}

impl DepthProcessBlock {
    pub fn new(
        device_session: &Arc<dyn DeviceSessionHwl>,
        generator: Arc<dyn DepthGenerator>,
        async_mode: bool,
    ) -> Self {
        let ir_active_array_ratio = Self::compute_ir_ratio(device_session).unwrap_or(1.0);

        let core = Arc::new(DepthCore {
            generator: generator.clone(),
            result_processor: Mutex::new(None),
            configured: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
        });

        if async_mode {
            let weak_core: Weak<DepthCore> = Arc::downgrade(&core);
            generator.set_result_callback(Some(Arc::new(move |status, frame_number| {
                if let Some(core) = weak_core.upgrade() {
                    core.complete_frame(frame_number, status);
                }
            })));
        }

        info!(
            "Bloc de profondeur créé (asynchrone: {}, rapport matrice: {:.3})",
            async_mode, ir_active_array_ratio
        );
        Self {
            core,
            async_mode,
            ir_active_array_ratio,
        }
    }

    fn compute_ir_ratio(device_session: &Arc<dyn DeviceSessionHwl>) -> Option<f32> {
        let logical = device_session.get_camera_characteristics().ok()?;
        let logical_array = logical.get_i32_slice(tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE)?;

        // La première caméra infrarouge donne la géométrie de référence
        let physical_ids = device_session.get_physical_camera_ids();
        let ir_id = physical_ids.get(1).copied()?;
        let ir = device_session.get_physical_camera_characteristics(ir_id).ok()?;
        let ir_array = ir.get_i32_slice(tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE)?;

        if logical_array.len() != 4 || ir_array.len() != 4 || logical_array[2] == 0 {
            return None;
        }
        Some(ir_array[2] as f32 / logical_array[2] as f32)
    }

    fn make_depth_buffer(stream: &Stream, buffer: &argos_core::StreamBuffer) -> DepthBuffer {
        DepthBuffer {
            format: Some(stream.format),
            planes: vec![PlaneLayout {
                stride: stream.width,
                scanline: stream.height,
            }],
            width: stream.width,
            height: stream.height,
            framework_buffer: buffer.clone(),
        }
    }

    /// Recale la région de recadrage logique dans la matrice du capteur
    /// infrarouge
    fn rescale_crop_region(&self, settings: &mut Metadata) {
        if let Some(crop) = settings.get_i32_slice(tags::SCALER_CROP_REGION) {
            if crop.len() == 4 {
                let scaled: Vec<i32> = crop
                    .iter()
                    .map(|value| (*value as f32 * self.ir_active_array_ratio) as i32)
                    .collect();
                settings.set_i32(tags::SCALER_CROP_REGION, &scaled);
            }
        }
    }

    fn build_request_info(
        &self,
        config: &DepthConfig,
        request: &CaptureRequest,
    ) -> Result<DepthRequestInfo, SessionError> {
        let mut color_buffer = Vec::new();
        let mut ir_buffer: Vec<Vec<DepthBuffer>> = Vec::new();
        let mut color_buffer_metadata = None;

        for (index, buffer) in request.input_buffers.iter().enumerate() {
            let stream = config.streams.get(&buffer.stream_id).ok_or_else(|| {
                SessionError::BadValue(format!(
                    "Flux d'entrée {} inconnu du bloc de profondeur",
                    buffer.stream_id
                ))
            })?;

            match stream.format {
                PixelFormat::Ycbcr420_888 => {
                    color_buffer.push(Self::make_depth_buffer(stream, buffer));
                    color_buffer_metadata = request
                        .input_buffer_metadata
                        .get(index)
                        .and_then(|metadata| metadata.clone());
                }
                PixelFormat::Y8 => {
                    ir_buffer.push(vec![Self::make_depth_buffer(stream, buffer)]);
                }
                format => {
                    return Err(SessionError::BadValue(format!(
                        "Format d'entrée inattendu pour la profondeur: {:?}",
                        format
                    )));
                }
            }
        }

        let depth_output = request
            .output_buffers
            .iter()
            .find(|buffer| buffer.stream_id == config.depth_stream_id)
            .ok_or_else(|| {
                SessionError::BadValue(format!(
                    "Trame {}: pas de buffer de profondeur",
                    request.frame_number
                ))
            })?;
        let depth_stream = &config.streams[&config.depth_stream_id];

        let mut settings = request.settings.clone();
        if let Some(settings) = settings.as_mut() {
            self.rescale_crop_region(settings);
        }

        Ok(DepthRequestInfo {
            frame_number: request.frame_number,
            color_buffer,
            ir_buffer,
            depth_buffer: Self::make_depth_buffer(depth_stream, depth_output),
            settings,
            color_buffer_metadata,
        })
    }
}

impl ProcessBlock for DepthProcessBlock {
    fn configure_streams(
        &self,
        block_config: &StreamConfiguration,
        _overall_config: &StreamConfiguration,
    ) -> Result<(), SessionError> {
        let mut configured = self.core.configured.write();
        if configured.is_some() {
            return Err(SessionError::AlreadyExists(
                "Bloc de profondeur déjà configuré".to_string(),
            ));
        }

        let mut streams = HashMap::new();
        let mut hal_streams = Vec::new();
        let mut depth_stream_id = None;
        for stream in &block_config.streams {
            if hal_utils::is_depth_stream(stream) {
                depth_stream_id = Some(stream.id);
            }
            streams.insert(stream.id, stream.clone());
            hal_streams.push(HalStream {
                id: stream.id,
                override_format: stream.format,
                producer_usage: usage::SW_WRITE_OFTEN,
                consumer_usage: stream.usage | usage::SW_READ_OFTEN,
                max_buffers: 4,
                override_data_space: stream.data_space,
                is_physical_camera_stream: stream.is_physical_camera_stream,
                physical_camera_id: stream.physical_camera_id,
            });
        }

        let depth_stream_id = depth_stream_id.ok_or_else(|| {
            SessionError::BadValue(
                "Configuration du bloc de profondeur sans flux de profondeur".to_string(),
            )
        })?;

        *configured = Some(DepthConfig {
            hal_streams,
            streams,
            depth_stream_id,
        });
        Ok(())
    }

    fn set_result_processor(
        &self,
        result_processor: Arc<dyn ResultProcessor>,
    ) -> Result<(), SessionError> {
        let mut slot = self.core.result_processor.lock();
        if slot.is_some() {
            return Err(SessionError::AlreadyExists(
                "Processeur de résultats déjà installé".to_string(),
            ));
        }
        *slot = Some(result_processor);
        Ok(())
    }

    fn get_configured_hal_streams(&self) -> Result<Vec<HalStream>, SessionError> {
        self.core
            .configured
            .read()
            .as_ref()
            .map(|config| config.hal_streams.clone())
            .ok_or_else(|| SessionError::NoInit("Bloc de profondeur non configuré".to_string()))
    }

    fn process_requests(
        &self,
        block_requests: &[ProcessBlockRequest],
        remaining_session_request: &CaptureRequest,
    ) -> Result<(), SessionError> {
        if block_requests.len() != 1 {
            return Err(SessionError::BadValue(format!(
                "Le bloc de profondeur attend une requête, {} reçues",
                block_requests.len()
            )));
        }

        let request = &block_requests[0].request;
        let info = {
            let configured = self.core.configured.read();
            let config = configured.as_ref().ok_or_else(|| {
                SessionError::NoInit("Bloc de profondeur non configuré".to_string())
            })?;
            self.build_request_info(config, request)?
        };

        {
            let result_processor = self.core.result_processor.lock();
            let result_processor = result_processor.as_ref().ok_or_else(|| {
                SessionError::NoInit("Processeur de résultats absent".to_string())
            })?;
            result_processor.add_pending_requests(block_requests, remaining_session_request)?;
        }

        self.core.pending.lock().insert(
            request.frame_number,
            PendingDepth {
                depth_buffer: info.depth_buffer.framework_buffer.clone(),
                input_buffers: request.input_buffers.clone(),
            },
        );

        if self.async_mode {
            if let Err(e) = self.core.generator.enqueue_process_request(info) {
                error!(
                    "Dépôt de la trame {} au générateur échoué: {}",
                    request.frame_number, e
                );
                self.core
                    .complete_frame(request.frame_number, DepthResultStatus::Error);
            }
        } else {
            let status = match self.core.generator.execute_process_request(&info) {
                Ok(()) => DepthResultStatus::Ok,
                Err(e) => {
                    error!(
                        "Génération de profondeur de la trame {} échouée: {}",
                        request.frame_number, e
                    );
                    DepthResultStatus::Error
                }
            };
            self.core.complete_frame(request.frame_number, status);
        }

        Ok(())
    }

    fn flush(&self) -> Result<(), SessionError> {
        let frames: Vec<u32> = self.core.pending.lock().keys().copied().collect();
        for frame_number in frames {
            self.core
                .complete_frame(frame_number, DepthResultStatus::Error);
        }
        Ok(())
    }
}
