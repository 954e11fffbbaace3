use std::sync::Arc;

use log::{info, warn};
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
use crate::SessionError;

struct ConfiguredState {
    internal_stream_manager: Arc<InternalStreamManager>,
}

/// Processeur de requêtes de la chaîne hors ligne HDR+.
///
/// À chaque requête, emprunte à l'anneau les N trames RAW les plus récentes
/// et leurs métadonnées (N = trames de charge utile des caractéristiques),
/// retire des métadonnées empruntées la famille des tags JPEG, et soumet
/// une unique requête de rafale au bloc.
pub struct HdrplusRequestProcessor {
    raw_stream_id: i32,
    payload_frames: usize,
    configured: Mutex<Option<ConfiguredState>>,
    process_block: Mutex<Option<Box<dyn ProcessBlock>>>,
}

impl HdrplusRequestProcessor {
    /// Échoue si les caractéristiques n'annoncent pas un nombre de trames
    /// de charge utile strictement positif
    pub fn new(
        device_session: &Arc<dyn DeviceSessionHwl>,
        raw_stream_id: i32,
    ) -> Result<Self, SessionError> {
        let characteristics = device_session.get_camera_characteristics()?;
        let payload_frames = characteristics
            .get_i32(vendor_tags::HDRPLUS_PAYLOAD_FRAMES)
            .filter(|frames| *frames > 0)
            .ok_or_else(|| {
                SessionError::BadValue(
                    "Trames de charge utile HDR+ absentes ou nulles".to_string(),
                )
            })?;

        info!("Rafale HDR+: {} trames de charge utile", payload_frames);
        Ok(Self {
            raw_stream_id,
            payload_frames: payload_frames as usize,
            configured: Mutex::new(None),
            process_block: Mutex::new(None),
        })
    }

    /// Vrai si aucun cliché n'est en cours sur l'anneau
    pub fn is_ready_for_next_request(&self) -> bool {
        match self.configured.lock().as_ref() {
            Some(state) => state
                .internal_stream_manager
                .is_pending_buffer_empty(self.raw_stream_id),
            None => false,
        }
    }
}

impl RequestProcessor for HdrplusRequestProcessor {
    fn configure_streams(
        &self,
        internal_stream_manager: &Arc<InternalStreamManager>,
        stream_config: &StreamConfiguration,
    ) -> Result<StreamConfiguration, SessionError> {
        let mut configured = self.configured.lock();
        if configured.is_some() {
            return Err(SessionError::AlreadyExists(
                "Processeur HDR+ déjà configuré".to_string(),
            ));
        }

        // Le flux RAW de l'anneau, vu en entrée par le pipeline de rafale.
        // L'identifiant est déjà celui attribué par le gestionnaire.
        let raw_stream = Stream {
            id: self.raw_stream_id,
            stream_type: StreamType::Input,
            width: 0,
            height: 0,
            format: PixelFormat::Raw10,
            data_space: DataSpace::Arbitrary,
            ..Default::default()
        };

        let mut block_config = StreamConfiguration {
            streams: stream_config.streams.clone(),
            operation_mode: stream_config.operation_mode,
            session_params: stream_config.session_params.clone(),
            stream_config_counter: stream_config.stream_config_counter,
        };
        block_config.streams.push(raw_stream);

        *configured = Some(ConfiguredState {
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
        let state = configured
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Processeur HDR+ non configuré".to_string()))?;
        let process_block = self.process_block.lock();
        let process_block = process_block
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Bloc de traitement absent".to_string()))?;

        if !state
            .internal_stream_manager
            .is_pending_buffer_empty(self.raw_stream_id)
        {
            return Err(SessionError::Exhausted(format!(
                "Trame {}: un cliché HDR+ est déjà en cours",
                request.frame_number
            )));
        }

        // Emprunter les N trames les plus récentes de l'anneau
        let (input_buffers, borrowed_metadata) = state
            .internal_stream_manager
            .get_most_recent_stream_buffer(self.raw_stream_id, self.payload_frames)
            .map_err(|e| {
                warn!(
                    "Trame {}: anneau RAW insuffisant pour la rafale: {}",
                    request.frame_number, e
                );
                e
            })?;

        let input_buffer_metadata: Vec<Option<Metadata>> = borrowed_metadata
            .into_iter()
            .map(|mut metadata| {
                // Les réglages JPEG de la trame d'origine ne concernent pas
                // la rafale
                hal_utils::remove_jpeg_metadata(&mut metadata);
                Some(metadata)
            })
            .collect();

        info!(
            "Trame {}: rafale HDR+ de {} entrées RAW",
            request.frame_number,
            input_buffers.len()
        );

        let block_request = ProcessBlockRequest {
            request_id: 0,
            request: CaptureRequest {
                frame_number: request.frame_number,
                settings: request.settings.clone(),
                input_buffers,
                input_buffer_metadata,
                output_buffers: request.output_buffers.clone(),
                physical_camera_settings: request.physical_camera_settings.clone(),
            },
        };

        process_block.process_requests(std::slice::from_ref(&block_request), request)
    }

    fn flush(&self) -> Result<(), SessionError> {
        match self.process_block.lock().as_ref() {
            Some(process_block) => process_block.flush(),
            None => Ok(()),
        }
    }
}
