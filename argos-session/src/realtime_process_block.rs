use std::sync::Arc;

use log::{error, warn};
use parking_lot::{Mutex, RwLock};

use argos_core::{CaptureRequest, HalStream, NotifyMessage, StreamConfiguration};
use argos_hwl::{DeviceSessionHwl, HwlPipelineCallback, HwlPipelineRequest, HwlPipelineResult};

use crate::process_block::{
    ProcessBlock, ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::result_processor::ResultProcessor;
use crate::SessionError;

/// État partagé avec les rappels du pipeline HWL, qui arrivent sur les
/// threads du HWL
struct BlockCore {
    /// Identifiant du pipeline une fois configuré
    pipeline_id: RwLock<Option<u32>>,

    /// Processeur de résultats, protégé séparément car les rappels arrivent
    /// sur d'autres threads
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
            None => error!(
                "Résultat du pipeline sans processeur de résultats, trame perdue"
            ),
        }
    }

    fn handle_pipeline_notify(&self, message: NotifyMessage) {
        let result_processor = self.result_processor.lock().clone();
        match result_processor {
            Some(result_processor) => result_processor.notify(ProcessBlockNotifyMessage {
                request_id: 0,
                message,
            }),
            None => error!("Notification du pipeline sans processeur de résultats"),
        }
    }
}

/// Bloc temps réel: un unique pipeline HWL, physique ou logique, avec une
/// correspondance requête à requête.
pub struct RealtimeProcessBlock {
    device_session: Arc<dyn DeviceSessionHwl>,
    camera_id: u32,
    core: Arc<BlockCore>,
}

impl RealtimeProcessBlock {
    pub fn new(device_session: Arc<dyn DeviceSessionHwl>) -> Self {
        let camera_id = device_session.get_camera_id();
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

impl ProcessBlock for RealtimeProcessBlock {
    fn configure_streams(
        &self,
        block_config: &StreamConfiguration,
        overall_config: &StreamConfiguration,
    ) -> Result<(), SessionError> {
        let mut pipeline_id = self.core.pipeline_id.write();
        if pipeline_id.is_some() {
            return Err(SessionError::AlreadyExists(
                "Bloc temps réel déjà configuré".to_string(),
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
        let pipeline_id = self.core.pipeline_id.read().ok_or_else(|| {
            SessionError::NoInit("Bloc temps réel non configuré".to_string())
        })?;
        Ok(self.device_session.get_configured_hal_streams(pipeline_id)?)
    }

    fn process_requests(
        &self,
        block_requests: &[ProcessBlockRequest],
        remaining_session_request: &CaptureRequest,
    ) -> Result<(), SessionError> {
        if block_requests.len() != 1 {
            return Err(SessionError::BadValue(format!(
                "Le bloc temps réel attend une requête, {} reçues",
                block_requests.len()
            )));
        }

        let pipeline_id = self.core.pipeline_id.read().ok_or_else(|| {
            SessionError::NoInit("Bloc temps réel non configuré".to_string())
        })?;

        {
            let result_processor = self.core.result_processor.lock();
            let result_processor = result_processor.as_ref().ok_or_else(|| {
                SessionError::NoInit("Processeur de résultats absent".to_string())
            })?;
            result_processor.add_pending_requests(block_requests, remaining_session_request)?;
        }

        let request = &block_requests[0].request;
        let hwl_request = HwlPipelineRequest {
            pipeline_id,
            settings: request.settings.clone(),
            input_buffers: request.input_buffers.clone(),
            input_buffer_metadata: request.input_buffer_metadata.clone(),
            output_buffers: request.output_buffers.clone(),
            physical_camera_settings: request.physical_camera_settings.clone(),
        };

        self.device_session
            .submit_requests(request.frame_number, vec![hwl_request])
            .map_err(|e| {
                warn!(
                    "Soumission de la trame {} refusée: {}",
                    request.frame_number, e
                );
                SessionError::from(e)
            })
    }

    fn flush(&self) -> Result<(), SessionError> {
        Ok(self.device_session.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic_result_processor::BasicResultProcessor;
    use argos_core::metadata::tags;
    use argos_core::{Metadata, PixelFormat, Stream, StreamBuffer};
    use argos_hwl::SimulatedHwlSession;
    use std::sync::mpsc;
    use std::time::Duration;

    fn make_config() -> StreamConfiguration {
        StreamConfiguration {
            streams: vec![Stream {
                id: 0,
                width: 640,
                height: 480,
                format: PixelFormat::Ycbcr420_888,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_configure_once() {
        let hwl = SimulatedHwlSession::single(0, Metadata::new());
        let block = RealtimeProcessBlock::new(hwl);
        let config = make_config();

        block.configure_streams(&config, &config).unwrap();
        assert!(block.configure_streams(&config, &config).is_err());
    }

    #[test]
    fn test_request_roundtrip() {
        let hwl = SimulatedHwlSession::single(0, Metadata::new());
        let block = RealtimeProcessBlock::new(hwl.clone());
        let config = make_config();
        block.configure_streams(&config, &config).unwrap();

        let result_processor = BasicResultProcessor::new();
        let (result_tx, result_rx) = mpsc::channel();
        let (notify_tx, _notify_rx) = mpsc::channel();
        result_processor.set_result_callback(
            Arc::new(move |result| {
                result_tx.send(result).unwrap();
            }),
            Arc::new(move |message| {
                let _ = notify_tx.send(message);
            }),
        );
        block.set_result_processor(result_processor).unwrap();

        hwl.build_pipelines().unwrap();

        let request = CaptureRequest {
            frame_number: 7,
            settings: Some(Metadata::new()),
            output_buffers: vec![StreamBuffer {
                stream_id: 0,
                buffer_id: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        block
            .process_requests(
                &[ProcessBlockRequest {
                    request_id: 0,
                    request: request.clone(),
                }],
                &request,
            )
            .unwrap();

        let result = result_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(result.frame_number, 7);
        assert!(result
            .result_metadata
            .as_ref()
            .unwrap()
            .get_i64(tags::SENSOR_TIMESTAMP)
            .is_some());
    }
}
