use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use argos_core::{
    CaptureRequest, HalStream, NotifyMessage, StreamConfiguration, StreamType,
};
use argos_hwl::{DeviceSessionHwl, HwlPipelineCallback, HwlPipelineRequest, HwlPipelineResult};

use crate::pipeline_request_id_manager::PipelineRequestIdManager;
use crate::process_block::{
    ProcessBlock, ProcessBlockNotifyMessage, ProcessBlockRequest, ProcessBlockResult,
};
use crate::result_processor::ResultProcessor;
use crate::SessionError;

struct ConfiguredState {
    /// Caméra physique → pipeline configuré
    camera_pipeline_ids: HashMap<u32, u32>,

    /// Flux → caméra physique propriétaire
    stream_camera_ids: HashMap<i32, u32>,
}

struct BlockCore {
    configured: RwLock<Option<ConfiguredState>>,
    result_processor: Mutex<Option<Arc<dyn ResultProcessor>>>,
    request_id_manager: PipelineRequestIdManager,
}

impl BlockCore {
    fn handle_pipeline_result(&self, result: HwlPipelineResult) {
        let request_id = match self
            .request_id_manager
            .get_pipeline_request_id(result.pipeline_id, result.frame_number)
        {
            Ok(request_id) => request_id,
            Err(e) => {
                error!(
                    "Résultat du pipeline {} trame {} non routable: {}",
                    result.pipeline_id, result.frame_number, e
                );
                return;
            }
        };

        let result_processor = self.result_processor.lock().clone();
        match result_processor {
            Some(result_processor) => result_processor.process_result(ProcessBlockResult {
                request_id,
                result: result.into(),
            }),
            None => error!("Résultat multi-caméras sans processeur de résultats"),
        }
    }

    fn handle_pipeline_notify(&self, pipeline_id: u32, message: NotifyMessage) {
        let request_id = match self
            .request_id_manager
            .get_pipeline_request_id(pipeline_id, message.frame_number())
        {
            Ok(request_id) => request_id,
            Err(e) => {
                error!(
                    "Notification du pipeline {} trame {} non routable: {}",
                    pipeline_id,
                    message.frame_number(),
                    e
                );
                return;
            }
        };

        let result_processor = self.result_processor.lock().clone();
        match result_processor {
            Some(result_processor) => result_processor.notify(ProcessBlockNotifyMessage {
                request_id,
                message,
            }),
            None => error!("Notification multi-caméras sans processeur de résultats"),
        }
    }
}

/// Bloc temps réel multi-caméras: les flux sont partitionnés par caméra
/// physique, un pipeline HWL par caméra, et chaque trame soumet une
/// sous-requête synchronisée par caméra.
pub struct MultiCameraRtProcessBlock {
    device_session: Arc<dyn DeviceSessionHwl>,
    core: Arc<BlockCore>,
}

impl MultiCameraRtProcessBlock {
    /// Échoue si le dispositif n'expose pas plusieurs caméras physiques
    pub fn new(device_session: Arc<dyn DeviceSessionHwl>) -> Result<Self, SessionError> {
        if device_session.get_physical_camera_ids().len() <= 1 {
            return Err(SessionError::BadValue(
                "Le bloc multi-caméras exige plusieurs caméras physiques".to_string(),
            ));
        }

        Ok(Self {
            device_session,
            core: Arc::new(BlockCore {
                configured: RwLock::new(None),
                result_processor: Mutex::new(None),
                request_id_manager: PipelineRequestIdManager::new(),
            }),
        })
    }

    /// Partitionne la configuration par caméra physique. Tous les flux
    /// doivent être des sorties physiques.
    fn partition_by_camera(
        block_config: &StreamConfiguration,
    ) -> Result<BTreeMap<u32, StreamConfiguration>, SessionError> {
        let mut partitions: BTreeMap<u32, StreamConfiguration> = BTreeMap::new();
        for stream in &block_config.streams {
            if stream.stream_type != StreamType::Output || !stream.is_physical_camera_stream {
                return Err(SessionError::BadValue(format!(
                    "Flux {}: seules les sorties physiques sont supportées",
                    stream.id
                )));
            }

            let partition = partitions
                .entry(stream.physical_camera_id)
                .or_insert_with(|| StreamConfiguration {
                    streams: Vec::new(),
                    operation_mode: block_config.operation_mode,
                    session_params: block_config.session_params.clone(),
                    stream_config_counter: block_config.stream_config_counter,
                });
            partition.streams.push(stream.clone());
        }
        Ok(partitions)
    }
}

impl ProcessBlock for MultiCameraRtProcessBlock {
    fn configure_streams(
        &self,
        block_config: &StreamConfiguration,
        overall_config: &StreamConfiguration,
    ) -> Result<(), SessionError> {
        let mut configured = self.core.configured.write();
        if configured.is_some() {
            return Err(SessionError::AlreadyExists(
                "Bloc multi-caméras déjà configuré".to_string(),
            ));
        }

        let partitions = Self::partition_by_camera(block_config)?;

        let mut camera_pipeline_ids = HashMap::new();
        let mut stream_camera_ids = HashMap::new();
        for (camera_id, partition) in &partitions {
            let result_core = self.core.clone();
            let notify_core = self.core.clone();
            let callback = HwlPipelineCallback {
                process_pipeline_result: Arc::new(move |result| {
                    result_core.handle_pipeline_result(result);
                }),
                notify: Arc::new(move |pipeline_id, message| {
                    notify_core.handle_pipeline_notify(pipeline_id, message);
                }),
            };

            let pipeline_id = self.device_session.configure_pipeline(
                *camera_id,
                callback,
                partition,
                overall_config,
            )?;
            camera_pipeline_ids.insert(*camera_id, pipeline_id);
            for stream in &partition.streams {
                stream_camera_ids.insert(stream.id, *camera_id);
            }
        }

        info!(
            "Bloc multi-caméras configuré: {} pipelines",
            camera_pipeline_ids.len()
        );
        *configured = Some(ConfiguredState {
            camera_pipeline_ids,
            stream_camera_ids,
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
        let configured = self.core.configured.read();
        let state = configured
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Bloc multi-caméras non configuré".to_string()))?;

        let mut hal_streams = Vec::new();
        for pipeline_id in state.camera_pipeline_ids.values() {
            hal_streams.extend(self.device_session.get_configured_hal_streams(*pipeline_id)?);
        }
        Ok(hal_streams)
    }

    fn process_requests(
        &self,
        block_requests: &[ProcessBlockRequest],
        remaining_session_request: &CaptureRequest,
    ) -> Result<(), SessionError> {
        let configured = self.core.configured.read();
        let state = configured
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Bloc multi-caméras non configuré".to_string()))?;

        // Invariants de soumission: pas d'entrées, une caméra par
        // sous-requête, pas deux sous-requêtes pour la même caméra. Le
        // routage n'est mémorisé qu'une fois le lot entier validé, pour ne
        // jamais laisser d'entrée orpheline après un refus partiel.
        let mut frame_number = None;
        let mut cameras_in_frame = HashSet::new();
        let mut hwl_requests = Vec::with_capacity(block_requests.len());
        let mut pending_routes = Vec::with_capacity(block_requests.len());

        for block_request in block_requests {
            let request = &block_request.request;
            if !request.input_buffers.is_empty() {
                return Err(SessionError::BadValue(format!(
                    "Trame {}: buffers d'entrée interdits",
                    request.frame_number
                )));
            }
            if request.output_buffers.is_empty() {
                return Err(SessionError::BadValue(format!(
                    "Trame {}: sous-requête sans sortie",
                    request.frame_number
                )));
            }
            if let Some(frame_number) = frame_number {
                if frame_number != request.frame_number {
                    return Err(SessionError::BadValue(
                        "Numéros de trame hétérogènes dans un même lot".to_string(),
                    ));
                }
            }
            frame_number = Some(request.frame_number);

            let mut camera_id = None;
            for buffer in &request.output_buffers {
                let stream_camera =
                    state.stream_camera_ids.get(&buffer.stream_id).ok_or_else(|| {
                        SessionError::BadValue(format!(
                            "Flux {} inconnu du bloc multi-caméras",
                            buffer.stream_id
                        ))
                    })?;
                if let Some(camera_id) = camera_id {
                    if camera_id != *stream_camera {
                        return Err(SessionError::BadValue(format!(
                            "Trame {}: une sous-requête mélange les caméras {} et {}",
                            request.frame_number, camera_id, stream_camera
                        )));
                    }
                }
                camera_id = Some(*stream_camera);
            }
            let camera_id = camera_id.unwrap();

            if !cameras_in_frame.insert(camera_id) {
                return Err(SessionError::BadValue(format!(
                    "Trame {}: deux sous-requêtes visent la caméra {}",
                    request.frame_number, camera_id
                )));
            }

            let pipeline_id = state.camera_pipeline_ids[&camera_id];
            pending_routes.push((block_request.request_id, pipeline_id, request.frame_number));

            hwl_requests.push(HwlPipelineRequest {
                pipeline_id,
                settings: request.settings.clone(),
                input_buffers: Vec::new(),
                input_buffer_metadata: Vec::new(),
                output_buffers: request.output_buffers.clone(),
                physical_camera_settings: request.physical_camera_settings.clone(),
            });
        }

        let frame_number = frame_number
            .ok_or_else(|| SessionError::BadValue("Lot de requêtes vide".to_string()))?;

        {
            let result_processor = self.core.result_processor.lock();
            let result_processor = result_processor.as_ref().ok_or_else(|| {
                SessionError::NoInit("Processeur de résultats absent".to_string())
            })?;
            result_processor.add_pending_requests(block_requests, remaining_session_request)?;
        }

        // Mémoriser le routage du lot complet, en défaisant les entrées
        // déjà posées si une collision survient
        for (index, &(request_id, pipeline_id, route_frame)) in pending_routes.iter().enumerate() {
            if let Err(e) = self.core.request_id_manager.set_pipeline_request_id(
                request_id,
                pipeline_id,
                route_frame,
            ) {
                for &(_, pipeline_id, route_frame) in &pending_routes[..index] {
                    self.core
                        .request_id_manager
                        .remove_pipeline_request_id(pipeline_id, route_frame);
                }
                return Err(e);
            }
        }

        self.device_session
            .submit_requests(frame_number, hwl_requests)
            .map_err(|e| {
                // Rien n'a été soumis: le routage du lot est retiré
                for &(_, pipeline_id, route_frame) in &pending_routes {
                    self.core
                        .request_id_manager
                        .remove_pipeline_request_id(pipeline_id, route_frame);
                }
                warn!("Soumission multi-caméras de la trame {} refusée: {}", frame_number, e);
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
    use argos_core::{Metadata, PixelFormat, Stream, StreamBuffer};
    use argos_hwl::SimulatedHwlSession;

    fn make_physical_stream(id: i32, camera_id: u32) -> Stream {
        Stream {
            id,
            width: 640,
            height: 480,
            format: PixelFormat::Y8,
            is_physical_camera_stream: true,
            physical_camera_id: camera_id,
            ..Default::default()
        }
    }

    fn make_logical_hwl() -> Arc<SimulatedHwlSession> {
        SimulatedHwlSession::logical(
            0,
            Metadata::new(),
            vec![(1, Metadata::new()), (2, Metadata::new())],
        )
    }

    #[test]
    fn test_single_camera_rejected() {
        let hwl = SimulatedHwlSession::single(0, Metadata::new());
        assert!(MultiCameraRtProcessBlock::new(hwl).is_err());
    }

    #[test]
    fn test_partition_rejects_logical_streams() {
        let hwl = make_logical_hwl();
        let block = MultiCameraRtProcessBlock::new(hwl).unwrap();

        let config = StreamConfiguration {
            streams: vec![Stream {
                id: 0,
                width: 640,
                height: 480,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(block.configure_streams(&config, &config).is_err());
    }

    #[test]
    fn test_duplicate_camera_in_frame_rejected() {
        let hwl = make_logical_hwl();
        let block = MultiCameraRtProcessBlock::new(hwl.clone()).unwrap();

        let config = StreamConfiguration {
            streams: vec![make_physical_stream(0, 1), make_physical_stream(1, 2)],
            ..Default::default()
        };
        block.configure_streams(&config, &config).unwrap();
        block
            .set_result_processor(crate::basic_result_processor::BasicResultProcessor::new())
            .unwrap();
        hwl.build_pipelines().unwrap();

        let make_request = |request_id, stream_id| ProcessBlockRequest {
            request_id,
            request: CaptureRequest {
                frame_number: 1,
                output_buffers: vec![StreamBuffer {
                    stream_id,
                    buffer_id: 1,
                    ..Default::default()
                }],
                ..Default::default()
            },
        };

        // Deux sous-requêtes pour la caméra 1 (flux 0)
        let remaining = CaptureRequest {
            frame_number: 1,
            ..Default::default()
        };
        let result =
            block.process_requests(&[make_request(1, 0), make_request(2, 0)], &remaining);
        assert!(result.is_err());

        // Le lot refusé n'a laissé aucun routage orphelin: la même trame
        // se resoumet proprement avec un lot valide
        let retry = [make_request(3, 0), make_request(4, 1)];
        assert!(block.process_requests(&retry, &remaining).is_ok());
    }
}
