use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use argos_core::{
    CaptureRequest, PixelFormat, Stream, StreamConfiguration, StreamType,
};

use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::{ProcessBlock, ProcessBlockRequest};
use crate::request_processor::RequestProcessor;
use crate::SessionError;

/// Résolution des flux infrarouges internes du segment de profondeur
const IR_STREAM_WIDTH: u32 = 640;
const IR_STREAM_HEIGHT: u32 = 480;

struct ConfiguredState {
    /// Flux du framework → caméra physique destinataire
    stream_physical_camera_ids: HashMap<i32, u32>,

    /// Flux Y8 internes (un par caméra infrarouge) quand la profondeur est
    /// configurée
    internal_ir_stream_ids: Option<[i32; 2]>,

    /// Flux de profondeur du framework, exclu du bloc temps réel
    depth_stream_id: Option<i32>,

    internal_stream_manager: Arc<InternalStreamManager>,
}

/// Processeur de requêtes du dispositif double infrarouge: les flux
/// logiques sont affectés à la caméra meneuse, puis chaque requête est
/// éclatée en une requête de bloc par caméra physique, l'identifiant de
/// requête portant la caméra.
pub struct DualIrRequestProcessor {
    lead_camera_id: u32,
    ir_camera_ids: [u32; 2],
    configured: Mutex<Option<ConfiguredState>>,
    process_block: Mutex<Option<Box<dyn ProcessBlock>>>,
}

impl DualIrRequestProcessor {
    /// Échoue si le dispositif n'expose pas exactement deux caméras
    /// physiques
    pub fn new(physical_camera_ids: &[u32], lead_camera_id: u32) -> Result<Self, SessionError> {
        if physical_camera_ids.len() != 2 {
            return Err(SessionError::BadValue(format!(
                "Deux caméras infrarouges attendues, {} présentes",
                physical_camera_ids.len()
            )));
        }
        if !physical_camera_ids.contains(&lead_camera_id) {
            return Err(SessionError::BadValue(format!(
                "La caméra meneuse {} n'est pas physique",
                lead_camera_id
            )));
        }

        Ok(Self {
            lead_camera_id,
            ir_camera_ids: [physical_camera_ids[0], physical_camera_ids[1]],
            configured: Mutex::new(None),
            process_block: Mutex::new(None),
        })
    }

    /// Flux internes enregistrés à la configuration, pour le câblage du
    /// segment de profondeur
    pub fn internal_ir_stream_ids(&self) -> Option<[i32; 2]> {
        self.configured
            .lock()
            .as_ref()
            .and_then(|state| state.internal_ir_stream_ids)
    }
}

impl RequestProcessor for DualIrRequestProcessor {
    fn configure_streams(
        &self,
        internal_stream_manager: &Arc<InternalStreamManager>,
        stream_config: &StreamConfiguration,
    ) -> Result<StreamConfiguration, SessionError> {
        let mut configured = self.configured.lock();
        if configured.is_some() {
            return Err(SessionError::AlreadyExists(
                "Processeur double infrarouge déjà configuré".to_string(),
            ));
        }

        let mut block_config = StreamConfiguration {
            streams: Vec::new(),
            operation_mode: stream_config.operation_mode,
            session_params: stream_config.session_params.clone(),
            stream_config_counter: stream_config.stream_config_counter,
        };

        let mut stream_physical_camera_ids = HashMap::new();
        let mut depth_stream_id = None;
        for stream in &stream_config.streams {
            if hal_utils::is_depth_stream(stream) {
                // La profondeur sort du segment aval, pas du bloc temps réel
                depth_stream_id = Some(stream.id);
                continue;
            }

            let mut assigned = stream.clone();
            if !assigned.is_physical_camera_stream {
                assigned.is_physical_camera_stream = true;
                assigned.physical_camera_id = self.lead_camera_id;
            }
            stream_physical_camera_ids.insert(assigned.id, assigned.physical_camera_id);
            block_config.streams.push(assigned);
        }

        // Segment de profondeur: un flux Y8 interne par caméra infrarouge
        let internal_ir_stream_ids = if depth_stream_id.is_some() {
            let mut ids = [0i32; 2];
            for (index, camera_id) in self.ir_camera_ids.iter().enumerate() {
                let ir_stream = Stream {
                    stream_type: StreamType::Output,
                    width: IR_STREAM_WIDTH,
                    height: IR_STREAM_HEIGHT,
                    format: PixelFormat::Y8,
                    is_physical_camera_stream: true,
                    physical_camera_id: *camera_id,
                    ..Default::default()
                };
                let stream_id = internal_stream_manager.register_new_internal_stream(&ir_stream)?;
                ids[index] = stream_id;

                let mut registered = ir_stream;
                registered.id = stream_id;
                block_config.streams.push(registered);
            }
            info!(
                "Flux infrarouges internes enregistrés: {} et {}",
                ids[0], ids[1]
            );
            Some(ids)
        } else {
            None
        };

        *configured = Some(ConfiguredState {
            stream_physical_camera_ids,
            internal_ir_stream_ids,
            depth_stream_id,
            internal_stream_manager: internal_stream_manager.clone(),
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
        let state = configured.as_ref().ok_or_else(|| {
            SessionError::NoInit("Processeur double infrarouge non configuré".to_string())
        })?;
        let process_block = self.process_block.lock();
        let process_block = process_block
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Bloc de traitement absent".to_string()))?;

        // Une requête par caméra physique, sorties partitionnées
        let mut per_camera: BTreeMap<u32, CaptureRequest> = BTreeMap::new();
        let mut has_depth_output = false;
        for buffer in &request.output_buffers {
            if state.depth_stream_id == Some(buffer.stream_id) {
                has_depth_output = true;
                continue;
            }

            let camera_id = state
                .stream_physical_camera_ids
                .get(&buffer.stream_id)
                .ok_or_else(|| {
                    SessionError::BadValue(format!("Flux {} non configuré", buffer.stream_id))
                })?;

            let physical_request = per_camera.entry(*camera_id).or_insert_with(|| CaptureRequest {
                frame_number: request.frame_number,
                settings: request.settings.clone(),
                ..Default::default()
            });
            physical_request.output_buffers.push(buffer.clone());
        }

        // Une trame de profondeur exige une image de chaque caméra
        if has_depth_output {
            let ir_stream_ids = state.internal_ir_stream_ids.ok_or_else(|| {
                SessionError::NoInit("Segment de profondeur non configuré".to_string())
            })?;
            for (index, camera_id) in self.ir_camera_ids.iter().enumerate() {
                let ir_buffer = state
                    .internal_stream_manager
                    .get_stream_buffer(ir_stream_ids[index])
                    .map_err(|e| {
                        warn!(
                            "Trame {}: buffer infrarouge interne indisponible: {}",
                            request.frame_number, e
                        );
                        e
                    })?;
                let physical_request =
                    per_camera.entry(*camera_id).or_insert_with(|| CaptureRequest {
                        frame_number: request.frame_number,
                        settings: request.settings.clone(),
                        ..Default::default()
                    });
                physical_request.output_buffers.push(ir_buffer);
            }
        }

        let block_requests: Vec<ProcessBlockRequest> = per_camera
            .into_iter()
            .map(|(camera_id, physical_request)| ProcessBlockRequest {
                request_id: camera_id,
                request: physical_request,
            })
            .collect();

        if block_requests.is_empty() {
            return Err(SessionError::BadValue(format!(
                "Trame {}: aucune sortie à router",
                request.frame_number
            )));
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
    use argos_hwl::SimpleBufferAllocator;

    fn make_config(stream_ids: &[(i32, Option<u32>)]) -> StreamConfiguration {
        StreamConfiguration {
            streams: stream_ids
                .iter()
                .map(|(id, camera)| Stream {
                    id: *id,
                    width: 640,
                    height: 480,
                    format: PixelFormat::Y8,
                    is_physical_camera_stream: camera.is_some(),
                    physical_camera_id: camera.unwrap_or(0),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_logical_streams_assigned_to_lead() {
        let processor = DualIrRequestProcessor::new(&[3, 4], 3).unwrap();
        let manager = InternalStreamManager::new(SimpleBufferAllocator::new());

        let config = make_config(&[(0, None), (1, Some(4))]);
        let block_config = processor.configure_streams(&manager, &config).unwrap();

        let logical = block_config.streams.iter().find(|s| s.id == 0).unwrap();
        assert!(logical.is_physical_camera_stream);
        assert_eq!(logical.physical_camera_id, 3);

        let physical = block_config.streams.iter().find(|s| s.id == 1).unwrap();
        assert_eq!(physical.physical_camera_id, 4);
    }

    #[test]
    fn test_two_cameras_required() {
        assert!(DualIrRequestProcessor::new(&[3], 3).is_err());
        assert!(DualIrRequestProcessor::new(&[3, 4], 9).is_err());
    }
}
