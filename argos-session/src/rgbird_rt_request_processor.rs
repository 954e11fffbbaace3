use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use argos_core::metadata::{tags, vendor_tags};
use argos_core::{
    CaptureRequest, DataSpace, Metadata, PixelFormat, Stream, StreamConfiguration, StreamType,
};
use argos_hwl::DeviceSessionHwl;

use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::{ProcessBlock, ProcessBlockRequest};
use crate::request_processor::RequestProcessor;
use crate::rgbird_result_request_processor::RgbirdInternalStreams;
use crate::SessionError;

/// Résolution de repli du YUV de synchronisation
const DEFAULT_YUV_STREAM_WIDTH: u32 = 640;
const DEFAULT_YUV_STREAM_HEIGHT: u32 = 480;

/// Résolution des flux infrarouges internes
const IR_STREAM_WIDTH: u32 = 640;
const IR_STREAM_HEIGHT: u32 = 480;

struct ConfiguredState {
    internal_stream_manager: Arc<InternalStreamManager>,
    rgb_yuv_stream_id: Option<i32>,
    ir_raw_stream_ids: Option<[i32; 2]>,
    rgb_raw_stream_id: Option<i32>,
    depth_stream_id: Option<i32>,
}

/// Processeur de requêtes de la topologie à trois capteurs RGB+IR+IR.
///
/// Éclate chaque requête du framework en au plus trois requêtes de bloc par
/// caméra. La sous-requête RGB porte les flux du framework, le YUV de
/// synchronisation (trames de profondeur et trame d'auto-calibration), et
/// l'anneau RAW HDR+ quand la prévisualisation a démarré et que la
/// thermique le permet; chaque sous-requête infrarouge porte son Y8 interne.
pub struct RgbirdRtRequestProcessor {
    rgb_camera_id: u32,
    ir_camera_ids: [u32; 2],
    active_array_width: u32,
    active_array_height: u32,
    is_hdrplus_supported: bool,
    autocal_frame_number: u32,
    non_warped_yuv_sizes: Vec<(u32, u32)>,
    configured: Mutex<Option<ConfiguredState>>,
    process_block: Mutex<Option<Box<dyn ProcessBlock>>>,
    preview_intent_seen: AtomicBool,
    is_hdrplus_zsl_enabled: AtomicBool,
}

impl RgbirdRtRequestProcessor {
    /// Échoue si le dispositif n'expose pas exactement trois caméras
    /// physiques. La première caméra est le capteur RGB, les deux suivantes
    /// les capteurs infrarouges.
    pub fn new(
        device_session: &Arc<dyn DeviceSessionHwl>,
        is_hdrplus_supported: bool,
        autocal_frame_number: u32,
    ) -> Result<Self, SessionError> {
        let physical_ids = device_session.get_physical_camera_ids();
        if physical_ids.len() != 3 {
            return Err(SessionError::BadValue(format!(
                "Trois caméras physiques attendues, {} présentes",
                physical_ids.len()
            )));
        }

        let characteristics = device_session.get_camera_characteristics()?;
        let active_array = characteristics
            .get_i32_slice(tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE)
            .filter(|array| array.len() == 4)
            .ok_or_else(|| {
                SessionError::BadValue("Matrice active absente des caractéristiques".to_string())
            })?;

        let non_warped_yuv_sizes = characteristics
            .get_i32_slice(vendor_tags::AVAILABLE_NON_WARPED_YUV_SIZES)
            .map(|sizes| {
                sizes
                    .chunks_exact(2)
                    .map(|pair| (pair[0] as u32, pair[1] as u32))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            rgb_camera_id: physical_ids[0],
            ir_camera_ids: [physical_ids[1], physical_ids[2]],
            active_array_width: active_array[2] as u32,
            active_array_height: active_array[3] as u32,
            is_hdrplus_supported,
            autocal_frame_number,
            non_warped_yuv_sizes,
            configured: Mutex::new(None),
            process_block: Mutex::new(None),
            preview_intent_seen: AtomicBool::new(false),
            is_hdrplus_zsl_enabled: AtomicBool::new(is_hdrplus_supported),
        })
    }

    /// Identifiants des flux internes, pour le câblage du processeur de
    /// résultats et du segment de profondeur
    pub fn internal_streams(&self) -> Option<RgbirdInternalStreams> {
        self.configured.lock().as_ref().map(|state| RgbirdInternalStreams {
            rgb_yuv_stream_id: state.rgb_yuv_stream_id.unwrap_or(-1),
            ir_stream_ids: state.ir_raw_stream_ids.unwrap_or([-1, -1]),
            rgb_raw_stream_id: state.rgb_raw_stream_id,
        })
    }

    /// Plus petite résolution YUV: celle des tailles non déformées
    /// annoncées pour une session d'auto-calibration, sinon la plus petite
    /// des résolutions YUV configurées par le framework
    fn find_smallest_yuv_resolution(&self, stream_config: &StreamConfiguration) -> (u32, u32) {
        if let Some(smallest) = self
            .non_warped_yuv_sizes
            .iter()
            .min_by_key(|(width, height)| width * height)
        {
            return *smallest;
        }

        stream_config
            .streams
            .iter()
            .filter(|stream| {
                stream.format == PixelFormat::Ycbcr420_888
                    || stream.format == PixelFormat::ImplementationDefined
            })
            .map(|stream| (stream.width, stream.height))
            .min_by_key(|(width, height)| width * height)
            .unwrap_or((DEFAULT_YUV_STREAM_WIDTH, DEFAULT_YUV_STREAM_HEIGHT))
    }

    fn register_depth_internal_streams(
        &self,
        internal_stream_manager: &Arc<InternalStreamManager>,
        stream_config: &StreamConfiguration,
        block_config: &mut StreamConfiguration,
    ) -> Result<(i32, [i32; 2]), SessionError> {
        let (yuv_width, yuv_height) = self.find_smallest_yuv_resolution(stream_config);
        info!(
            "YUV de synchronisation interne: {}x{}",
            yuv_width, yuv_height
        );

        let mut yuv_stream = Stream {
            stream_type: StreamType::Output,
            width: yuv_width,
            height: yuv_height,
            format: PixelFormat::Ycbcr420_888,
            data_space: DataSpace::Arbitrary,
            is_physical_camera_stream: true,
            physical_camera_id: self.rgb_camera_id,
            ..Default::default()
        };
        let yuv_stream_id = internal_stream_manager.register_new_internal_stream(&yuv_stream)?;
        yuv_stream.id = yuv_stream_id;
        block_config.streams.push(yuv_stream);

        // Le YUV de synchronisation ne doit pas être déformé par le
        // post-traitement du HWL
        let session_params = block_config
            .session_params
            .get_or_insert_with(Metadata::new);
        session_params.set_i32(vendor_tags::NON_WARPED_YUV_STREAM_ID, &[yuv_stream_id]);

        let mut ir_stream_ids = [0i32; 2];
        for (index, camera_id) in self.ir_camera_ids.iter().enumerate() {
            let mut ir_stream = Stream {
                stream_type: StreamType::Output,
                width: IR_STREAM_WIDTH,
                height: IR_STREAM_HEIGHT,
                format: PixelFormat::Y8,
                data_space: DataSpace::Arbitrary,
                is_physical_camera_stream: true,
                physical_camera_id: *camera_id,
                ..Default::default()
            };
            let stream_id = internal_stream_manager.register_new_internal_stream(&ir_stream)?;
            ir_stream.id = stream_id;
            ir_stream_ids[index] = stream_id;
            block_config.streams.push(ir_stream);
        }

        Ok((yuv_stream_id, ir_stream_ids))
    }
}

impl RequestProcessor for RgbirdRtRequestProcessor {
    fn configure_streams(
        &self,
        internal_stream_manager: &Arc<InternalStreamManager>,
        stream_config: &StreamConfiguration,
    ) -> Result<StreamConfiguration, SessionError> {
        let mut configured = self.configured.lock();
        if configured.is_some() {
            return Err(SessionError::AlreadyExists(
                "Processeur RGB+IR déjà configuré".to_string(),
            ));
        }

        let mut block_config = StreamConfiguration {
            streams: Vec::new(),
            operation_mode: stream_config.operation_mode,
            session_params: stream_config.session_params.clone(),
            stream_config_counter: stream_config.stream_config_counter,
        };

        // Les flux du framework sont servis par le capteur RGB; la
        // profondeur est produite par le segment aval
        let mut depth_stream_id = None;
        for stream in &stream_config.streams {
            if hal_utils::is_depth_stream(stream) {
                depth_stream_id = Some(stream.id);
                continue;
            }
            let mut assigned = stream.clone();
            if !assigned.is_physical_camera_stream {
                assigned.is_physical_camera_stream = true;
                assigned.physical_camera_id = self.rgb_camera_id;
            }
            block_config.streams.push(assigned);
        }

        let (rgb_yuv_stream_id, ir_raw_stream_ids) = if depth_stream_id.is_some() {
            let (yuv, irs) = self.register_depth_internal_streams(
                internal_stream_manager,
                stream_config,
                &mut block_config,
            )?;
            (Some(yuv), Some(irs))
        } else {
            (None, None)
        };

        // L'anneau RAW HDR+ du capteur RGB
        let rgb_raw_stream_id = if self.is_hdrplus_supported {
            let mut raw_stream = Stream {
                stream_type: StreamType::Output,
                width: self.active_array_width,
                height: self.active_array_height,
                format: PixelFormat::Raw10,
                data_space: DataSpace::Arbitrary,
                is_physical_camera_stream: true,
                physical_camera_id: self.rgb_camera_id,
                ..Default::default()
            };
            let stream_id = internal_stream_manager.register_new_internal_stream(&raw_stream)?;
            raw_stream.id = stream_id;
            block_config.streams.push(raw_stream);
            Some(stream_id)
        } else {
            None
        };

        *configured = Some(ConfiguredState {
            internal_stream_manager: internal_stream_manager.clone(),
            rgb_yuv_stream_id,
            ir_raw_stream_ids,
            rgb_raw_stream_id,
            depth_stream_id,
        });
        Ok(block_config)
    }

    fn set_process_block(&self, process_block: Box<dyn ProcessBlock>) -> Result<(), SessionError> {
        let mut slot = self.process_block.lock();
        if slot.is_some() {
            return Err(SessionError::AlreadyExists(
                "Bloc de traitement déjà installé".to_string(),
            ));
        }
        *slot = Some(process_block);
        Ok(())
    }

    fn process_request(&self, request: &CaptureRequest) -> Result<(), SessionError> {
        let configured = self.configured.lock();
        let state = configured
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Processeur RGB+IR non configuré".to_string()))?;
        let process_block = self.process_block.lock();
        let process_block = process_block
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Bloc de traitement absent".to_string()))?;

        if let Some(settings) = &request.settings {
            if self.is_hdrplus_zsl_enabled.load(Ordering::SeqCst)
                && settings.get_u8(vendor_tags::THERMAL_THROTTLING) == Some(1)
            {
                self.is_hdrplus_zsl_enabled.store(false, Ordering::SeqCst);
                info!(
                    "Trame {}: anneau RAW HDR+ coupé par l'étranglement thermique",
                    request.frame_number
                );
            }
            if !self.preview_intent_seen.load(Ordering::SeqCst)
                && settings.get_u8(tags::CONTROL_CAPTURE_INTENT)
                    == Some(tags::CAPTURE_INTENT_PREVIEW)
            {
                self.preview_intent_seen.store(true, Ordering::SeqCst);
            }
        }

        let has_depth_output = state
            .depth_stream_id
            .map(|depth_stream_id| request.has_output_stream(depth_stream_id))
            .unwrap_or(false);
        let is_autocal_frame =
            state.rgb_yuv_stream_id.is_some() && request.frame_number == self.autocal_frame_number;

        // Sous-requête du capteur RGB: les flux du framework hors profondeur
        let mut rgb_request = CaptureRequest {
            frame_number: request.frame_number,
            settings: request.settings.clone(),
            ..Default::default()
        };
        for buffer in &request.output_buffers {
            if state.depth_stream_id != Some(buffer.stream_id) {
                rgb_request.output_buffers.push(buffer.clone());
            }
        }

        // YUV de synchronisation pour la profondeur et l'auto-calibration
        if has_depth_output || is_autocal_frame {
            let yuv_stream_id = state.rgb_yuv_stream_id.ok_or_else(|| {
                SessionError::NoInit("YUV de synchronisation non configuré".to_string())
            })?;
            let yuv_buffer = state
                .internal_stream_manager
                .get_stream_buffer(yuv_stream_id)?;
            rgb_request.output_buffers.push(yuv_buffer);
            if is_autocal_frame {
                debug!(
                    "Trame {}: YUV d'auto-calibration attaché",
                    request.frame_number
                );
            }
        }

        // Anneau RAW HDR+
        if self.is_hdrplus_zsl_enabled.load(Ordering::SeqCst)
            && self.preview_intent_seen.load(Ordering::SeqCst)
        {
            if let Some(raw_stream_id) = state.rgb_raw_stream_id {
                let raw_buffer = state
                    .internal_stream_manager
                    .get_stream_buffer(raw_stream_id)
                    .map_err(|e| {
                        warn!(
                            "Trame {}: buffer RAW HDR+ indisponible: {}",
                            request.frame_number, e
                        );
                        e
                    })?;
                rgb_request.output_buffers.push(raw_buffer);
                if let Some(settings) = rgb_request.settings.as_mut() {
                    hal_utils::modify_realtime_request_for_hdrplus(settings, true);
                }
            }
        }

        let mut block_requests = vec![ProcessBlockRequest {
            request_id: self.rgb_camera_id,
            request: rgb_request,
        }];

        // Sous-requêtes infrarouges pour les trames de profondeur
        if has_depth_output {
            let ir_stream_ids = state.ir_raw_stream_ids.ok_or_else(|| {
                SessionError::NoInit("Flux infrarouges non configurés".to_string())
            })?;
            for (index, camera_id) in self.ir_camera_ids.iter().enumerate() {
                let ir_buffer = state
                    .internal_stream_manager
                    .get_stream_buffer(ir_stream_ids[index])?;
                block_requests.push(ProcessBlockRequest {
                    request_id: *camera_id,
                    request: CaptureRequest {
                        frame_number: request.frame_number,
                        settings: request.settings.clone(),
                        output_buffers: vec![ir_buffer],
                        ..Default::default()
                    },
                });
            }
        }

        process_block.process_requests(&block_requests, request)
    }

    fn flush(&self) -> Result<(), SessionError> {
        match self.process_block.lock().as_ref() {
            Some(process_block) => process_block.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::{HalStream, StreamBuffer};
    use argos_hwl::{SimpleBufferAllocator, SimulatedHwlSession};
    use parking_lot::Mutex as PlMutex;

    struct RecordingBlock {
        requests: Arc<PlMutex<Vec<Vec<ProcessBlockRequest>>>>,
    }

    impl ProcessBlock for RecordingBlock {
        fn configure_streams(
            &self,
            _block_config: &StreamConfiguration,
            _overall_config: &StreamConfiguration,
        ) -> Result<(), SessionError> {
            Ok(())
        }

        fn set_result_processor(
            &self,
            _result_processor: Arc<dyn crate::result_processor::ResultProcessor>,
        ) -> Result<(), SessionError> {
            Ok(())
        }

        fn get_configured_hal_streams(&self) -> Result<Vec<HalStream>, SessionError> {
            Ok(Vec::new())
        }

        fn process_requests(
            &self,
            block_requests: &[ProcessBlockRequest],
            _remaining_session_request: &CaptureRequest,
        ) -> Result<(), SessionError> {
            self.requests.lock().push(block_requests.to_vec());
            Ok(())
        }

        fn flush(&self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn make_device_session() -> Arc<dyn DeviceSessionHwl> {
        let mut characteristics = Metadata::new();
        characteristics.set_i32(
            tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE,
            &[0, 0, 4032, 3024],
        );
        SimulatedHwlSession::logical(
            0,
            characteristics,
            vec![
                (1, Metadata::new()),
                (2, Metadata::new()),
                (3, Metadata::new()),
            ],
        )
    }

    fn make_stream_config(with_depth: bool) -> StreamConfiguration {
        let mut streams = vec![Stream {
            id: 0,
            width: 1280,
            height: 720,
            format: PixelFormat::Ycbcr420_888,
            usage: argos_core::stream::usage::HW_TEXTURE,
            ..Default::default()
        }];
        if with_depth {
            streams.push(Stream {
                id: 1,
                width: 640,
                height: 480,
                format: PixelFormat::Y16,
                data_space: DataSpace::Depth,
                ..Default::default()
            });
        }
        StreamConfiguration {
            streams,
            ..Default::default()
        }
    }

    fn setup(
        with_depth: bool,
    ) -> (
        RgbirdRtRequestProcessor,
        Arc<InternalStreamManager>,
        Arc<PlMutex<Vec<Vec<ProcessBlockRequest>>>>,
    ) {
        let device_session = make_device_session();
        let processor = RgbirdRtRequestProcessor::new(&device_session, false, 5).unwrap();
        let manager = InternalStreamManager::new(SimpleBufferAllocator::new());
        let block_config = processor
            .configure_streams(&manager, &make_stream_config(with_depth))
            .unwrap();

        // Allouer les pools des flux internes
        let internal_streams = processor.internal_streams().unwrap();
        if with_depth {
            for stream_id in [internal_streams.rgb_yuv_stream_id]
                .into_iter()
                .chain(internal_streams.ir_stream_ids)
            {
                assert!(block_config.streams.iter().any(|s| s.id == stream_id));
                manager
                    .allocate_buffers(
                        &HalStream {
                            id: stream_id,
                            max_buffers: 4,
                            ..Default::default()
                        },
                        0,
                    )
                    .unwrap();
            }
        }

        let requests = Arc::new(PlMutex::new(Vec::new()));
        processor
            .set_process_block(Box::new(RecordingBlock {
                requests: requests.clone(),
            }))
            .unwrap();
        (processor, manager, requests)
    }

    #[test]
    fn test_preview_request_stays_on_rgb() {
        let (processor, _manager, requests) = setup(true);

        let request = CaptureRequest {
            frame_number: 1,
            settings: Some(Metadata::new()),
            output_buffers: vec![StreamBuffer {
                stream_id: 0,
                buffer_id: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        processor.process_request(&request).unwrap();

        let recorded = requests.lock();
        assert_eq!(recorded[0].len(), 1);
        assert_eq!(recorded[0][0].request_id, 1);
    }

    #[test]
    fn test_depth_request_fans_out_to_three_cameras() {
        let (processor, _manager, requests) = setup(true);
        let internal_streams = processor.internal_streams().unwrap();

        let request = CaptureRequest {
            frame_number: 2,
            settings: Some(Metadata::new()),
            output_buffers: vec![
                StreamBuffer {
                    stream_id: 0,
                    buffer_id: 1,
                    ..Default::default()
                },
                StreamBuffer {
                    stream_id: 1,
                    buffer_id: 2,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        processor.process_request(&request).unwrap();

        let recorded = requests.lock();
        let fan_out = &recorded[0];
        assert_eq!(fan_out.len(), 3);

        // La sous-requête RGB porte la prévisualisation et le YUV interne
        let rgb = fan_out.iter().find(|r| r.request_id == 1).unwrap();
        assert!(rgb.request.has_output_stream(0));
        assert!(rgb
            .request
            .has_output_stream(internal_streams.rgb_yuv_stream_id));
        // Aucune sous-requête ne porte la profondeur
        for block_request in fan_out {
            assert!(!block_request.request.has_output_stream(1));
        }

        // Chaque caméra infrarouge a son Y8 interne
        for (camera_id, stream_id) in [(2u32, internal_streams.ir_stream_ids[0]),
            (3u32, internal_streams.ir_stream_ids[1])]
        {
            let ir = fan_out.iter().find(|r| r.request_id == camera_id).unwrap();
            assert!(ir.request.has_output_stream(stream_id));
        }
    }

    #[test]
    fn test_autocal_frame_attaches_yuv() {
        let (processor, _manager, requests) = setup(true);
        let internal_streams = processor.internal_streams().unwrap();

        // Trame d'auto-calibration (5) sans sortie de profondeur
        let request = CaptureRequest {
            frame_number: 5,
            settings: Some(Metadata::new()),
            output_buffers: vec![StreamBuffer {
                stream_id: 0,
                buffer_id: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        processor.process_request(&request).unwrap();

        let recorded = requests.lock();
        let rgb = &recorded[0][0];
        assert!(rgb
            .request
            .has_output_stream(internal_streams.rgb_yuv_stream_id));
    }
}
