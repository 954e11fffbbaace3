use std::sync::Arc;

use log::{error, info};
use parking_lot::{Mutex, RwLock};

use argos_core::{CaptureRequest, HalStream, NotifyMessage, StreamConfiguration};
use argos_hwl::{DeviceSessionHwl, HwlPipelineCallback, HwlPipelineRequest, HwlPipelineResult};

use crate::process_block::{
    ProcessBlock, ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::result_processor::ResultProcessor;
use crate::SessionError;

struct BlockCore {
    pipeline_id: RwLock<Option<u32>>,
    result_processor: Mutex<Option<Arc<dyn ResultProcessor>>>,
}

impl BlockCore {
    fn handle_pipeline_result(&self, result: HwlPipelineResult) {
        let result_processor = self.result_processor.lock().clone();
        match result_processor {
            Some(result_processor) => result_processor.process_result(ProcessBlockResult {
                request_id: 0,
                result: result.into(),
            }),
            None => error!("Résultat HDR+ sans processeur de résultats, trame perdue"),
        }
    }

    fn handle_pipeline_notify(&self, message: NotifyMessage) {
        let result_processor = self.result_processor.lock().clone();
        match result_processor {
            Some(result_processor) => result_processor.notify(ProcessBlockNotifyMessage {
                request_id: 0,
                message,
            }),
            None => error!("Notification HDR+ sans processeur de résultats"),
        }
    }
}

/// Bloc hors ligne de traitement en rafale: la requête porte en entrée N
/// trames RAW antérieures et leurs métadonnées, soumises d'un bloc au
/// pipeline de rafale du HWL.
pub struct HdrplusProcessBlock {
    device_session: Arc<dyn DeviceSessionHwl>,
    camera_id: u32,
    core: Arc<BlockCore>,
}

impl HdrplusProcessBlock {
    pub fn new(device_session: Arc<dyn DeviceSessionHwl>, camera_id: u32) -> Self {
        Self {
            device_session,
            camera_id,
            core: Arc::new(BlockCore {
                pipeline_id: RwLock::new(None),
                result_processor: Mutex::new(None),
            }),
        }
    }
}

impl ProcessBlock for HdrplusProcessBlock {
    fn configure_streams(
        &self,
        block_config: &StreamConfiguration,
        overall_config: &StreamConfiguration,
    ) -> Result<(), SessionError> {
        let mut pipeline_id = self.core.pipeline_id.write();
        if pipeline_id.is_some() {
            return Err(SessionError::AlreadyExists(
                "Bloc HDR+ déjà configuré".to_string(),
            ));
        }

        let result_core = self.core.clone();
        let notify_core = self.core.clone();
        let callback = HwlPipelineCallback {
            process_pipeline_result: Arc::new(move |result| {
                result_core.handle_pipeline_result(result);
            }),
            notify: Arc::new(move |_pipeline_id, message| {
                notify_core.handle_pipeline_notify(message);
            }),
        };

        let id = self.device_session.configure_pipeline(
            self.camera_id,
            callback,
            block_config,
            overall_config,
        )?;
        *pipeline_id = Some(id);
        info!("Pipeline de rafale HDR+ configuré: {}", id);
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
        let pipeline_id = self
            .core
            .pipeline_id
            .read()
            .ok_or_else(|| SessionError::NoInit("Bloc HDR+ non configuré".to_string()))?;
        Ok(self.device_session.get_configured_hal_streams(pipeline_id)?)
    }

    fn process_requests(
        &self,
        block_requests: &[ProcessBlockRequest],
        remaining_session_request: &CaptureRequest,
    ) -> Result<(), SessionError> {
        if block_requests.len() != 1 {
            return Err(SessionError::BadValue(format!(
                "Le bloc HDR+ attend une requête, {} reçues",
                block_requests.len()
            )));
        }

        let request = &block_requests[0].request;
        if request.input_buffers.is_empty() {
            return Err(SessionError::BadValue(format!(
                "Trame {}: la rafale HDR+ exige des buffers d'entrée",
                request.frame_number
            )));
        }

        let pipeline_id = self
            .core
            .pipeline_id
            .read()
            .ok_or_else(|| SessionError::NoInit("Bloc HDR+ non configuré".to_string()))?;

        {
            let result_processor = self.core.result_processor.lock();
            let result_processor = result_processor.as_ref().ok_or_else(|| {
                SessionError::NoInit("Processeur de résultats absent".to_string())
            })?;
            result_processor.add_pending_requests(block_requests, remaining_session_request)?;
        }

        let hwl_request = HwlPipelineRequest {
            pipeline_id,
            settings: request.settings.clone(),
            input_buffers: request.input_buffers.clone(),
            input_buffer_metadata: request.input_buffer_metadata.clone(),
            output_buffers: request.output_buffers.clone(),
            physical_camera_settings: request.physical_camera_settings.clone(),
        };

        Ok(self
            .device_session
            .submit_requests(request.frame_number, vec![hwl_request])?)
    }

    fn flush(&self) -> Result<(), SessionError> {
        Ok(self.device_session.flush()?)
    }
}
