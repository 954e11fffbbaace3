use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;

use argos_core::metadata::{tags, vendor_tags};
use argos_core::{
    CaptureRequest, DataSpace, HdrUsageMode, Metadata, PixelFormat, ProcessingMode, Stream,
    StreamConfiguration, StreamType,
};
use argos_hwl::DeviceSessionHwl;

use crate::hal_utils;
use crate::internal_stream_manager::InternalStreamManager;
use crate::process_block::{ProcessBlock, ProcessBlockRequest};
use crate::request_processor::RequestProcessor;
use crate::SessionError;

struct ConfiguredState {
    internal_stream_manager: Arc<InternalStreamManager>,
    raw_stream_id: i32,
}

/// Processeur de requêtes de la chaîne temps réel à anneau ZSL.
///
/// À la configuration, enregistre un flux RAW10 interne à la pleine
/// résolution du capteur. Ensuite, dès qu'une requête avec intention de
/// prévisualisation a été vue, attache un buffer RAW à chaque requête
/// sortante pour alimenter l'anneau. L'observation du tag d'étranglement
/// thermique coupe définitivement cette alimentation pour la session.
pub struct RealtimeZslRequestProcessor {
    active_array_width: u32,
    active_array_height: u32,
    hdr_mode: HdrUsageMode,
    processing_mode: ProcessingMode,
    configured: Mutex<Option<ConfiguredState>>,
    process_block: Mutex<Option<Box<dyn ProcessBlock>>>,
    preview_intent_seen: AtomicBool,
    is_hdrplus_zsl_enabled: AtomicBool,
}

impl RealtimeZslRequestProcessor {
    /// Échoue si le dispositif agrège plusieurs caméras physiques ou si les
    /// caractéristiques n'annoncent pas la matrice active
    pub fn new(
        device_session: &Arc<dyn DeviceSessionHwl>,
        processing_mode: ProcessingMode,
    ) -> Result<Self, SessionError> {
        if device_session.get_physical_camera_ids().len() > 1 {
            return Err(SessionError::BadValue(
                "La chaîne ZSL temps réel ne supporte qu'une caméra physique".to_string(),
            ));
        }

        let characteristics = device_session.get_camera_characteristics()?;
        let active_array = characteristics
            .get_i32_slice(tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE)
            .filter(|array| array.len() == 4)
            .ok_or_else(|| {
                SessionError::BadValue("Matrice active absente des caractéristiques".to_string())
            })?;

        let hdr_mode = characteristics
            .get_u8(vendor_tags::HDR_USAGE_MODE)
            .and_then(HdrUsageMode::from_u8)
            .unwrap_or(HdrUsageMode::Hdrplus);

        Ok(Self {
            active_array_width: active_array[2] as u32,
            active_array_height: active_array[3] as u32,
            hdr_mode,
            processing_mode,
            configured: Mutex::new(None),
            process_block: Mutex::new(None),
            preview_intent_seen: AtomicBool::new(false),
            is_hdrplus_zsl_enabled: AtomicBool::new(true),
        })
    }

    /// Identifiant du flux RAW interne, disponible après configuration
    pub fn raw_stream_id(&self) -> Option<i32> {
        self.configured.lock().as_ref().map(|state| state.raw_stream_id)
    }
}

impl RequestProcessor for RealtimeZslRequestProcessor {
    fn configure_streams(
        &self,
        internal_stream_manager: &Arc<InternalStreamManager>,
        stream_config: &StreamConfiguration,
    ) -> Result<StreamConfiguration, SessionError> {
        let mut configured = self.configured.lock();
        if configured.is_some() {
            return Err(SessionError::AlreadyExists(
                "Processeur ZSL temps réel déjà configuré".to_string(),
            ));
        }

        // L'anneau interne capture le RAW pleine résolution
        let mut raw_stream = Stream {
            stream_type: StreamType::Output,
            width: self.active_array_width,
            height: self.active_array_height,
            format: PixelFormat::Raw10,
            rotation: Default::default(),
            data_space: DataSpace::Arbitrary,
            ..Default::default()
        };
        let raw_stream_id = internal_stream_manager.register_new_internal_stream(&raw_stream)?;
        raw_stream.id = raw_stream_id;
        info!(
            "Flux RAW interne {} enregistré ({}x{})",
            raw_stream_id, self.active_array_width, self.active_array_height
        );

        let mut block_config = StreamConfiguration {
            streams: stream_config.streams.clone(),
            operation_mode: stream_config.operation_mode,
            session_params: stream_config.session_params.clone(),
            stream_config_counter: stream_config.stream_config_counter,
        };
        block_config.streams.push(raw_stream);

        *configured = Some(ConfiguredState {
            internal_stream_manager: internal_stream_manager.clone(),
            raw_stream_id,
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
            SessionError::NoInit("Processeur ZSL temps réel non configuré".to_string())
        })?;
        let process_block = self.process_block.lock();
        let process_block = process_block
            .as_ref()
            .ok_or_else(|| SessionError::NoInit("Bloc de traitement absent".to_string()))?;

        if let Some(settings) = &request.settings {
            // L'étranglement thermique coupe l'alimentation de l'anneau pour
            // le reste de la session
            if self.is_hdrplus_zsl_enabled.load(Ordering::SeqCst)
                && settings.get_u8(vendor_tags::THERMAL_THROTTLING) == Some(1)
            {
                self.is_hdrplus_zsl_enabled.store(false, Ordering::SeqCst);
                info!(
                    "Trame {}: alimentation ZSL coupée par l'étranglement thermique",
                    request.frame_number
                );
            }

            if !self.preview_intent_seen.load(Ordering::SeqCst)
                && settings.get_u8(tags::CONTROL_CAPTURE_INTENT)
                    == Some(tags::CAPTURE_INTENT_PREVIEW)
            {
                self.preview_intent_seen.store(true, Ordering::SeqCst);
                info!(
                    "Trame {}: première intention de prévisualisation, l'anneau démarre",
                    request.frame_number
                );
            }
        }

        let mut block_request = ProcessBlockRequest {
            request_id: 0,
            request: request.clone(),
        };

        if self.is_hdrplus_zsl_enabled.load(Ordering::SeqCst)
            && self.preview_intent_seen.load(Ordering::SeqCst)
        {
            let raw_buffer = state
                .internal_stream_manager
                .get_stream_buffer(state.raw_stream_id)
                .map_err(|e| {
                    warn!(
                        "Trame {}: buffer RAW interne indisponible: {}",
                        request.frame_number, e
                    );
                    e
                })?;
            block_request.request.output_buffers.push(raw_buffer);

            if let Some(settings) = block_request.request.settings.as_mut() {
                let hybrid_ae = self.hdr_mode != HdrUsageMode::NonHdrplus;
                hal_utils::modify_realtime_request_for_hdrplus(settings, hybrid_ae);

                if self.processing_mode == ProcessingMode::Intermediate {
                    settings.set_u8(
                        vendor_tags::PROCESSING_MODE,
                        ProcessingMode::Intermediate.to_u8(),
                    );
                }
            }
        }

        process_block.process_requests(std::slice::from_ref(&block_request), request)
    }

    fn flush(&self) -> Result<(), SessionError> {
        match self.process_block.lock().as_ref() {
            Some(process_block) => process_block.flush(),
            None => Ok(()),
        }
    }
}
