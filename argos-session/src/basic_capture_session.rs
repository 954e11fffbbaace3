use std::sync::Arc;

use log::{error, info};

use argos_core::{CaptureRequest, HalStream, StreamConfiguration};
use argos_hwl::DeviceSessionHwl;

use crate::basic_request_processor::BasicRequestProcessor;
use crate::basic_result_processor::BasicResultProcessor;
use crate::capture_session::{
    make_chain_callbacks, purge_hal_configured_streams, verify_all_streams_configured,
    CaptureSession, CaptureSessionParams,
};
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::ProcessBlock;
use crate::realtime_process_block::RealtimeProcessBlock;
use crate::request_processor::RequestProcessor;
use crate::result_dispatcher::ResultDispatcher;
use crate::result_processor::ResultProcessor;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Session à chaîne unique: requête → bloc temps réel → remise directe.
/// Dernier recours garanti de la table de sélection.
pub struct BasicCaptureSession {
    device_session: Arc<dyn DeviceSessionHwl>,
    dispatcher: Arc<ResultDispatcher>,
    request_processor: BasicRequestProcessor,
}

impl BasicCaptureSession {
    /// La session de base accepte toute configuration valide
    pub fn is_stream_configuration_supported(
        _device_session: &Arc<dyn DeviceSessionHwl>,
        _stream_config: &StreamConfiguration,
    ) -> bool {
        true
    }

    pub fn create(
        params: &CaptureSessionParams,
        stream_config: &StreamConfiguration,
        process_capture_result: ProcessCaptureResultFn,
        notify: NotifyFn,
    ) -> Result<(Box<dyn CaptureSession>, Vec<HalStream>), SessionError> {
        let device_session = params.device_session.clone();
        let internal_stream_manager = InternalStreamManager::new(params.allocator.clone());
        let dispatcher = ResultDispatcher::new(false, process_capture_result, notify);
        let (chain_result, chain_notify) = make_chain_callbacks(&dispatcher);

        let request_processor = BasicRequestProcessor::new();
        let process_block = RealtimeProcessBlock::new(device_session.clone());

        let block_config =
            request_processor.configure_streams(&internal_stream_manager, stream_config)?;
        verify_all_streams_configured(stream_config, &block_config)?;
        process_block.configure_streams(&block_config, stream_config)?;

        let result_processor = BasicResultProcessor::new();
        result_processor.set_result_callback(chain_result, chain_notify);

        device_session.build_pipelines().map_err(|e| {
            error!("Construction des pipelines échouée: {}", e);
            device_session.destroy_pipelines();
            SessionError::from(e)
        })?;

        let hal_streams = process_block.get_configured_hal_streams()?;
        let hal_streams = purge_hal_configured_streams(stream_config, hal_streams);

        process_block.set_result_processor(result_processor)?;
        request_processor.set_process_block(Box::new(process_block))?;

        info!("Session de base créée ({} flux)", hal_streams.len());
        let session = Box::new(Self {
            device_session,
            dispatcher,
            request_processor,
        });
        Ok((session, hal_streams))
    }
}

impl CaptureSession for BasicCaptureSession {
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
        self.request_processor.flush()
    }
}

impl Drop for BasicCaptureSession {
    fn drop(&mut self) {
        self.device_session.destroy_pipelines();
    }
}
