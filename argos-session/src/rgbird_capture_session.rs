use std::collections::HashSet;
use std::sync::Arc;

use log::{error, info};

use argos_core::metadata::vendor_tags;
use argos_core::{CaptureRequest, HalStream, StreamConfiguration};
use argos_hwl::DeviceSessionHwl;

use crate::capture_session::{
    make_chain_callbacks, purge_hal_configured_streams, CaptureSession, CaptureSessionParams,
};
use crate::depth_process_block::DepthProcessBlock;
use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::multicam_rt_process_block::MultiCameraRtProcessBlock;
use crate::process_block::ProcessBlock;
use crate::request_processor::RequestProcessor;
use crate::result_dispatcher::ResultDispatcher;
use crate::result_processor::ResultProcessor;
use crate::rgbird_depth_result_processor::RgbirdDepthResultProcessor;
use crate::rgbird_result_request_processor::RgbirdResultRequestProcessor;
use crate::rgbird_rt_request_processor::RgbirdRtRequestProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Taille visée de l'anneau RAW HDR+ du capteur RGB
const RAW_BUFFER_COUNT: u32 = 16;

/// Plancher du nombre de buffers en vol sur le flux RAW
const RAW_MIN_BUFFER_COUNT: u32 = 12;

/// Supplément de buffers des pools YUV et infrarouges
const SYNC_STREAM_EXTRA_BUFFERS: u32 = 2;

/// Session à trois capteurs RGB+IR+IR: une chaîne temps réel multi-caméras,
/// prolongée d'un segment de profondeur quand un flux de profondeur est
/// configuré.
pub struct RgbirdCaptureSession {
    device_session: Arc<dyn DeviceSessionHwl>,
    dispatcher: Arc<ResultDispatcher>,
    request_processor: RgbirdRtRequestProcessor,
    result_request_processor: Arc<RgbirdResultRequestProcessor>,
}

impl RgbirdCaptureSession {
    pub fn is_stream_configuration_supported(
        device_session: &Arc<dyn DeviceSessionHwl>,
        _stream_config: &StreamConfiguration,
    ) -> bool {
        let physical_ids = device_session.get_physical_camera_ids();
        if physical_ids.len() != 3 {
            return false;
        }

        // Un capteur couleur et deux capteurs monochromes
        let rgb_characteristics =
            match device_session.get_physical_camera_characteristics(physical_ids[0]) {
                Ok(characteristics) => characteristics,
                Err(_) => return false,
            };
        if hal_utils::is_mono_camera(&rgb_characteristics) {
            return false;
        }
        for ir_id in &physical_ids[1..] {
            match device_session.get_physical_camera_characteristics(*ir_id) {
                Ok(characteristics) if hal_utils::is_mono_camera(&characteristics) => {}
                _ => return false,
            }
        }

        info!("Session RGB+IR+IR candidate pour cette configuration");
        true
    }

    pub fn create(
        params: &CaptureSessionParams,
        stream_config: &StreamConfiguration,
        process_capture_result: ProcessCaptureResultFn,
        notify: NotifyFn,
    ) -> Result<(Box<dyn CaptureSession>, Vec<HalStream>), SessionError> {
        let device_session = params.device_session.clone();
        if !Self::is_stream_configuration_supported(&device_session, stream_config) {
            return Err(SessionError::BadValue(
                "Configuration non supportée par la session RGB+IR+IR".to_string(),
            ));
        }

        let physical_ids = device_session.get_physical_camera_ids();
        let rgb_camera_id = physical_ids[0];

        let characteristics = device_session.get_camera_characteristics()?;
        let is_hdrplus_supported = characteristics
            .get_i32(vendor_tags::HDRPLUS_PAYLOAD_FRAMES)
            .map(|frames| frames > 0)
            .unwrap_or(false);

        let has_depth_stream = stream_config
            .streams
            .iter()
            .any(hal_utils::is_depth_stream);

        let internal_stream_manager = InternalStreamManager::new(params.allocator.clone());
        let dispatcher = ResultDispatcher::new(false, process_capture_result, notify);
        let (chain_result, chain_notify) = make_chain_callbacks(&dispatcher);

        // Chaîne temps réel multi-caméras
        let request_processor = RgbirdRtRequestProcessor::new(
            &device_session,
            is_hdrplus_supported,
            params.options.autocal_frame_number,
        )?;
        let realtime_block = MultiCameraRtProcessBlock::new(device_session.clone())?;
        let realtime_block_config =
            request_processor.configure_streams(&internal_stream_manager, stream_config)?;

        // Chaque flux du framework hors profondeur doit être servi par le
        // bloc temps réel
        let configured_ids: HashSet<i32> = realtime_block_config
            .streams
            .iter()
            .map(|stream| stream.id)
            .collect();
        for stream in &stream_config.streams {
            if !hal_utils::is_depth_stream(stream) && !configured_ids.contains(&stream.id) {
                return Err(SessionError::Internal(format!(
                    "Flux {} absent de la configuration du bloc temps réel",
                    stream.id
                )));
            }
        }

        let internal_streams = request_processor
            .internal_streams()
            .ok_or_else(|| SessionError::Internal("Flux internes non enregistrés".to_string()))?;
        realtime_block.configure_streams(&realtime_block_config, stream_config)?;

        let result_request_processor = RgbirdResultRequestProcessor::new(
            rgb_camera_id,
            internal_streams,
            internal_stream_manager.clone(),
            is_hdrplus_supported,
        );

        // Segment de profondeur
        let depth_parts = if has_depth_stream {
            let factory = params.depth_generator_factory.as_ref().ok_or_else(|| {
                SessionError::NoInit(
                    "Flux de profondeur configuré sans générateur de profondeur".to_string(),
                )
            })?;
            let depth_block = DepthProcessBlock::new(
                &device_session,
                factory(),
                params.options.depth_async,
            );
            let depth_block_config = RequestProcessor::configure_streams(
                result_request_processor.as_ref(),
                &internal_stream_manager,
                stream_config,
            )?;
            depth_block.configure_streams(&depth_block_config, stream_config)?;

            let depth_result_processor =
                RgbirdDepthResultProcessor::new(internal_stream_manager.clone());
            depth_result_processor.set_result_callback(chain_result.clone(), chain_notify.clone());
            Some((depth_block, depth_result_processor))
        } else {
            None
        };

        result_request_processor.set_result_callback(chain_result, chain_notify);

        device_session.build_pipelines().map_err(|e| {
            error!("Construction des pipelines échouée: {}", e);
            device_session.destroy_pipelines();
            SessionError::from(e)
        })?;

        let mut hal_streams = realtime_block.get_configured_hal_streams()?;

        // Dimensionner les pools des flux internes
        for hal_stream in &hal_streams {
            if hal_stream.id == internal_streams.rgb_yuv_stream_id
                || internal_streams.ir_stream_ids.contains(&hal_stream.id)
            {
                internal_stream_manager
                    .allocate_buffers(hal_stream, SYNC_STREAM_EXTRA_BUFFERS)?;
            } else if internal_streams.rgb_raw_stream_id == Some(hal_stream.id) {
                let mut raw_hal_stream = hal_stream.clone();
                if raw_hal_stream.max_buffers < RAW_MIN_BUFFER_COUNT {
                    raw_hal_stream.max_buffers = RAW_MIN_BUFFER_COUNT;
                }
                let additional = RAW_BUFFER_COUNT.saturating_sub(raw_hal_stream.max_buffers);
                internal_stream_manager.allocate_buffers(&raw_hal_stream, additional)?;
            }
        }

        if let Some((depth_block, _)) = &depth_parts {
            hal_streams.extend(depth_block.get_configured_hal_streams()?);
        }
        let hal_streams = purge_hal_configured_streams(stream_config, hal_streams);

        // Connexion: segment de profondeur d'abord, puis chaîne temps réel
        if let Some((depth_block, depth_result_processor)) = depth_parts {
            depth_block.set_result_processor(depth_result_processor)?;
            RequestProcessor::set_process_block(
                result_request_processor.as_ref(),
                Box::new(depth_block),
            )?;
        }
        realtime_block.set_result_processor(result_request_processor.clone())?;
        request_processor.set_process_block(Box::new(realtime_block))?;

        info!(
            "Session RGB+IR+IR créée ({} flux, profondeur: {})",
            hal_streams.len(),
            has_depth_stream
        );
        let session = Box::new(Self {
            device_session,
            dispatcher,
            request_processor,
            result_request_processor,
        });
        Ok((session, hal_streams))
    }
}

impl CaptureSession for RgbirdCaptureSession {
    fn process_request(&self, request: &CaptureRequest) -> Result<(), SessionError> {
        self.dispatcher.add_pending_request(request)?;

        self.request_processor.process_request(request).map_err(|e| {
            error!(
                "Trame {}: traitement échoué, retrait de la trame: {}",
                request.frame_number, e
            );
            self.dispatcher.remove_pending_request(request.frame_number);
            e
        })
    }

    fn flush(&self) -> Result<(), SessionError> {
        self.request_processor.flush()?;
        RequestProcessor::flush(self.result_request_processor.as_ref())
    }
}

impl Drop for RgbirdCaptureSession {
    fn drop(&mut self) {
        self.device_session.destroy_pipelines();
    }
}
