use std::collections::HashSet;
use std::sync::Arc;

use log::{error, info, warn};

use argos_core::metadata::vendor_tags;
use argos_core::{CaptureRequest, HalStream, StreamConfiguration};
use argos_hwl::DeviceSessionHwl;

use crate::capture_session::{
    make_chain_callbacks, purge_hal_configured_streams, CaptureSession, CaptureSessionParams,
};
use crate::depth_process_block::DepthProcessBlock;
use crate::dual_ir_depth_result_processor::DualIrDepthResultProcessor;
use crate::dual_ir_request_processor::DualIrRequestProcessor;
use crate::dual_ir_result_request_processor::DualIrResultRequestProcessor;
use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::multicam_rt_process_block::MultiCameraRtProcessBlock;
use crate::process_block::ProcessBlock;
use crate::request_processor::RequestProcessor;
use crate::result_dispatcher::ResultDispatcher;
use crate::result_processor::ResultProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Supplément de buffers des pools infrarouges internes
const IR_STREAM_EXTRA_BUFFERS: u32 = 2;

/// Session double infrarouge: deux capteurs monochromes synchronisés, leurs
/// métadonnées physiques agrégées en un résultat logique, avec un segment
/// de profondeur optionnel.
pub struct DualIrCaptureSession {
    device_session: Arc<dyn DeviceSessionHwl>,
    dispatcher: Arc<ResultDispatcher>,
    request_processor: DualIrRequestProcessor,
    result_request_processor: Arc<DualIrResultRequestProcessor>,
}

impl DualIrCaptureSession {
    pub fn is_stream_configuration_supported(
        device_session: &Arc<dyn DeviceSessionHwl>,
        stream_config: &StreamConfiguration,
    ) -> bool {
        let physical_ids = device_session.get_physical_camera_ids();
        if physical_ids.len() != 2 {
            return false;
        }

        for id in &physical_ids {
            match device_session.get_physical_camera_characteristics(*id) {
                Ok(characteristics) if hal_utils::is_mono_camera(&characteristics) => {}
                _ => return false,
            }
        }

        // Pas de mélange de flux logiques et physiques
        let mut physical_count = 0;
        let mut logical_count = 0;
        for stream in &stream_config.streams {
            if hal_utils::is_depth_stream(stream) {
                continue;
            }
            if stream.is_physical_camera_stream {
                physical_count += 1;
            } else {
                logical_count += 1;
            }
        }
        if physical_count > 0 && logical_count > 0 {
            return false;
        }

        info!("Session double infrarouge candidate pour cette configuration");
        true
    }

    fn lead_camera_id(
        device_session: &Arc<dyn DeviceSessionHwl>,
        physical_ids: &[u32],
    ) -> u32 {
        let default_id = device_session
            .get_camera_characteristics()
            .ok()
            .and_then(|characteristics| {
                characteristics.get_i32(vendor_tags::DEFAULT_PHYSICAL_CAM_ID)
            })
            .map(|id| id as u32);

        match default_id {
            Some(id) if physical_ids.contains(&id) => id,
            Some(id) => {
                warn!(
                    "Caméra meneuse {} inconnue, repli sur la première caméra physique",
                    id
                );
                physical_ids[0]
            }
            None => physical_ids[0],
        }
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
                "Configuration non supportée par la session double infrarouge".to_string(),
            ));
        }

        let physical_ids = device_session.get_physical_camera_ids();
        let ir_camera_ids = [physical_ids[0], physical_ids[1]];
        let lead_camera_id = Self::lead_camera_id(&device_session, &physical_ids);
        let logical_camera_id = device_session.get_camera_id();

        let has_depth_stream = stream_config
            .streams
            .iter()
            .any(hal_utils::is_depth_stream);

        let internal_stream_manager = InternalStreamManager::new(params.allocator.clone());
        let dispatcher = ResultDispatcher::new(false, process_capture_result, notify);
        let (chain_result, chain_notify) = make_chain_callbacks(&dispatcher);

        // Chaîne temps réel multi-caméras
        let request_processor = DualIrRequestProcessor::new(&physical_ids, lead_camera_id)?;
        let realtime_block = MultiCameraRtProcessBlock::new(device_session.clone())?;
        let realtime_block_config =
            request_processor.configure_streams(&internal_stream_manager, stream_config)?;

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

        realtime_block.configure_streams(&realtime_block_config, stream_config)?;

        let internal_ir_stream_ids = request_processor.internal_ir_stream_ids();
        let result_request_processor = DualIrResultRequestProcessor::new(
            stream_config,
            logical_camera_id,
            lead_camera_id,
            ir_camera_ids,
            internal_ir_stream_ids,
            internal_stream_manager.clone(),
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
                DualIrDepthResultProcessor::new(internal_stream_manager.clone());
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

        if let Some(ir_stream_ids) = internal_ir_stream_ids {
            for hal_stream in &hal_streams {
                if ir_stream_ids.contains(&hal_stream.id) {
                    internal_stream_manager
                        .allocate_buffers(hal_stream, IR_STREAM_EXTRA_BUFFERS)?;
                }
            }
        }

        if let Some((depth_block, _)) = &depth_parts {
            hal_streams.extend(depth_block.get_configured_hal_streams()?);
        }
        let hal_streams = purge_hal_configured_streams(stream_config, hal_streams);

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
            "Session double infrarouge créée (meneuse {}, {} flux, profondeur: {})",
            lead_camera_id,
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

impl CaptureSession for DualIrCaptureSession {
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

impl Drop for DualIrCaptureSession {
    fn drop(&mut self) {
        self.device_session.destroy_pipelines();
    }
}
