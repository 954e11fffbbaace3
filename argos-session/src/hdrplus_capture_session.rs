use std::sync::Arc;

use log::{error, info, warn};

use argos_core::metadata::vendor_tags;
use argos_core::stream::INVALID_STREAM_ID;
use argos_core::{
    CaptureRequest, HalStream, HdrUsageMode, ProcessingMode, StreamConfiguration,
};
use argos_hwl::DeviceSessionHwl;

use crate::capture_session::{
    make_chain_callbacks, purge_hal_configured_streams, verify_all_streams_configured,
    CaptureSession, CaptureSessionParams,
};
use crate::hal_utils;
use crate::hdrplus_process_block::HdrplusProcessBlock;
use crate::hdrplus_request_processor::HdrplusRequestProcessor;
use crate::hdrplus_result_processor::HdrplusResultProcessor;
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::ProcessBlock;
use crate::realtime_process_block::RealtimeProcessBlock;
use crate::realtime_zsl_request_processor::RealtimeZslRequestProcessor;
use crate::realtime_zsl_result_processor::RealtimeZslResultProcessor;
use crate::request_processor::RequestProcessor;
use crate::result_dispatcher::ResultDispatcher;
use crate::result_processor::ResultProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Taille visée de l'anneau RAW interne
const RAW_BUFFER_COUNT: u32 = 16;

/// Plancher du nombre de buffers en vol sur le flux RAW
const RAW_MIN_BUFFER_COUNT: u32 = 12;

/// Session HDR+: une chaîne temps réel à anneau ZSL pour la
/// prévisualisation, une chaîne hors ligne de rafale pour les clichés. Le
/// routage se décide requête par requête, avec repli sur la chaîne temps
/// réel quand la rafale ne peut pas être admise.
pub struct HdrplusCaptureSession {
    device_session: Arc<dyn DeviceSessionHwl>,
    dispatcher: Arc<ResultDispatcher>,
    request_processor: RealtimeZslRequestProcessor,
    hdrplus_request_processor: HdrplusRequestProcessor,
    preview_stream_id: i32,
}

impl HdrplusCaptureSession {
    pub fn is_stream_configuration_supported(
        device_session: &Arc<dyn DeviceSessionHwl>,
        stream_config: &StreamConfiguration,
    ) -> bool {
        if device_session.get_physical_camera_ids().len() > 1 {
            return false;
        }

        let characteristics = match device_session.get_camera_characteristics() {
            Ok(characteristics) => characteristics,
            Err(e) => {
                error!("Lecture des caractéristiques échouée: {}", e);
                return false;
            }
        };

        if !hal_utils::is_stream_hdrplus_compatible(stream_config, &characteristics) {
            return false;
        }

        if !hal_utils::is_bayer_camera(&characteristics) {
            info!("La caméra n'est pas un capteur de Bayer, HDR+ écarté");
            return false;
        }

        info!("HDR+ actif pour cette configuration");
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
                "Configuration non supportée par la session HDR+".to_string(),
            ));
        }

        let characteristics = device_session.get_camera_characteristics()?;
        let hdr_mode = characteristics
            .get_u8(vendor_tags::HDR_USAGE_MODE)
            .and_then(HdrUsageMode::from_u8)
            .unwrap_or(HdrUsageMode::Hdrplus);

        let preview_stream_id = stream_config
            .streams
            .iter()
            .find(|stream| hal_utils::is_preview_stream(stream))
            .map(|stream| stream.id)
            .unwrap_or(INVALID_STREAM_ID);

        let internal_stream_manager = InternalStreamManager::new(params.allocator.clone());
        let dispatcher = ResultDispatcher::new(false, process_capture_result, notify);
        let (chain_result, chain_notify) = make_chain_callbacks(&dispatcher);

        // Hors du mode HDR+, les métadonnées privées du HWL sont filtrées
        // avant remise
        let chain_result: ProcessCaptureResultFn = if hdr_mode != HdrUsageMode::Hdrplus {
            let filter_session = device_session.clone();
            Arc::new(move |mut result| {
                if let Some(metadata) = result.result_metadata.as_mut() {
                    filter_session.filter_result_metadata(metadata);
                }
                chain_result(result);
            })
        } else {
            chain_result
        };

        // Chaîne temps réel à anneau ZSL
        let request_processor =
            RealtimeZslRequestProcessor::new(&device_session, ProcessingMode::Final)?;
        let realtime_block = RealtimeProcessBlock::new(device_session.clone());
        let realtime_block_config =
            request_processor.configure_streams(&internal_stream_manager, stream_config)?;
        verify_all_streams_configured(stream_config, &realtime_block_config)?;
        let raw_stream_id = request_processor
            .raw_stream_id()
            .ok_or_else(|| SessionError::Internal("Flux RAW interne absent".to_string()))?;
        realtime_block.configure_streams(&realtime_block_config, stream_config)?;

        let realtime_result_processor =
            RealtimeZslResultProcessor::new(internal_stream_manager.clone(), raw_stream_id);
        realtime_result_processor.set_result_callback(chain_result.clone(), chain_notify.clone());

        // Chaîne hors ligne de rafale
        let hdrplus_block =
            HdrplusProcessBlock::new(device_session.clone(), device_session.get_camera_id());
        let hdrplus_request_processor =
            HdrplusRequestProcessor::new(&device_session, raw_stream_id)?;
        let hdrplus_result_processor =
            HdrplusResultProcessor::new(internal_stream_manager.clone(), raw_stream_id);
        hdrplus_result_processor.set_result_callback(chain_result, chain_notify);

        let hdrplus_block_config =
            hdrplus_request_processor.configure_streams(&internal_stream_manager, stream_config)?;
        verify_all_streams_configured(stream_config, &hdrplus_block_config)?;
        hdrplus_block.configure_streams(&hdrplus_block_config, stream_config)?;

        // Les deux chaînes sont configurées: construction des pipelines
        device_session.build_pipelines().map_err(|e| {
            error!("Construction des pipelines échouée: {}", e);
            device_session.destroy_pipelines();
            SessionError::from(e)
        })?;

        let mut hal_streams = realtime_block.get_configured_hal_streams()?;
        let hdrplus_hal_streams = hdrplus_block.get_configured_hal_streams()?;

        // Seul l'usage consommateur du RAW interne diffère entre les deux
        // chaînes: fusion directe, puis dimensionnement de l'anneau
        let raw_consumer_usage = hdrplus_hal_streams
            .iter()
            .find(|hal_stream| hal_stream.id == raw_stream_id)
            .map(|hal_stream| hal_stream.consumer_usage)
            .unwrap_or(0);
        for hal_stream in hal_streams.iter_mut() {
            if hal_stream.id == raw_stream_id {
                hal_stream.consumer_usage |= raw_consumer_usage;
                if hal_stream.max_buffers < RAW_MIN_BUFFER_COUNT {
                    hal_stream.max_buffers = RAW_MIN_BUFFER_COUNT;
                }
                let additional = RAW_BUFFER_COUNT.saturating_sub(hal_stream.max_buffers);
                internal_stream_manager.allocate_buffers(hal_stream, additional)?;
                break;
            }
        }

        let hal_streams = purge_hal_configured_streams(stream_config, hal_streams);

        // Connexion des deux chaînes
        realtime_block.set_result_processor(realtime_result_processor)?;
        request_processor.set_process_block(Box::new(realtime_block))?;
        hdrplus_block.set_result_processor(hdrplus_result_processor)?;
        hdrplus_request_processor.set_process_block(Box::new(hdrplus_block))?;

        info!(
            "Session HDR+ créée ({} flux, anneau RAW {})",
            hal_streams.len(),
            raw_stream_id
        );
        let session = Box::new(Self {
            device_session,
            dispatcher,
            request_processor,
            hdrplus_request_processor,
            preview_stream_id,
        });
        Ok((session, hal_streams))
    }
}

impl CaptureSession for HdrplusCaptureSession {
    fn process_request(&self, request: &CaptureRequest) -> Result<(), SessionError> {
        let is_hdrplus_request =
            hal_utils::is_request_hdrplus_compatible(request, self.preview_stream_id);

        self.dispatcher.add_pending_request(request)?;

        let result = if is_hdrplus_request {
            info!(
                "Trame {}: cliché HDR+ ({} sorties)",
                request.frame_number,
                request.output_buffers.len()
            );
            match self.hdrplus_request_processor.process_request(request) {
                Ok(()) => Ok(()),
                Err(e) => {
                    // Anneau insuffisant ou cliché en cours: repli temps réel
                    warn!(
                        "Trame {}: rafale refusée ({}), repli sur la chaîne temps réel",
                        request.frame_number, e
                    );
                    self.request_processor.process_request(request)
                }
            }
        } else {
            self.request_processor.process_request(request)
        };

        result.map_err(|e| {
            error!(
                "Trame {}: traitement échoué, retrait de la trame: {}",
                request.frame_number, e
            );
            self.dispatcher.remove_pending_request(request.frame_number);
            e
        })
    }

    fn flush(&self) -> Result<(), SessionError> {
        self.request_processor.flush()
    }
}

impl Drop for HdrplusCaptureSession {
    fn drop(&mut self) {
        self.device_session.destroy_pipelines();
    }
}
