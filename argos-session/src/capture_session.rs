use std::collections::HashSet;
use std::sync::Arc;

use log::{error, info};
use serde::{Deserialize, Serialize};

use argos_core::{
    validate_stream_configuration, CaptureRequest, HalStream, NotifyMessage, StreamConfiguration,
};
use argos_hwl::{DepthGeneratorFactory, DeviceSessionHwl, InternalBufferAllocator};

use crate::basic_capture_session::BasicCaptureSession;
use crate::dual_ir_capture_session::DualIrCaptureSession;
use crate::hdrplus_capture_session::HdrplusCaptureSession;
use crate::result_dispatcher::ResultDispatcher;
use crate::rgbird_capture_session::RgbirdCaptureSession;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Contrat d'une session de capture: une chaîne de traitement câblée pour
/// une configuration de flux donnée, dont la session possède la vie.
pub trait CaptureSession: Send + Sync {
    /// Traite une requête de capture
    fn process_request(&self, request: &CaptureRequest) -> Result<(), SessionError>;

    /// Annulation au mieux des requêtes en vol
    fn flush(&self) -> Result<(), SessionError>;
}

/// Options de comportement des sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Numéro de la trame d'auto-calibration de la chaîne RGB+IR+IR
    pub autocal_frame_number: u32,

    /// Vrai: le générateur de profondeur travaille en asynchrone
    pub depth_async: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            autocal_frame_number: 5,
            depth_async: false,
        }
    }
}

/// Dépendances partagées par toutes les sessions candidates
#[derive(Clone)]
pub struct CaptureSessionParams {
    /// Session HWL du dispositif ouvert
    pub device_session: Arc<dyn DeviceSessionHwl>,

    /// Allocateur des pools internes
    pub allocator: Arc<dyn InternalBufferAllocator>,

    /// Fabrique du générateur de profondeur, absente si le greffon n'est
    /// pas disponible
    pub depth_generator_factory: Option<DepthGeneratorFactory>,

    /// Options de comportement
    pub options: SessionOptions,
}

/// Prédicat de support d'une configuration par un type de session
pub type IsStreamConfigSupportedFn =
    fn(&Arc<dyn DeviceSessionHwl>, &StreamConfiguration) -> bool;

/// Fabrique d'une session câblée; renvoie la session et les flux HAL
/// visibles du framework
pub type CreateCaptureSessionFn = fn(
    &CaptureSessionParams,
    &StreamConfiguration,
    ProcessCaptureResultFn,
    NotifyFn,
) -> Result<(Box<dyn CaptureSession>, Vec<HalStream>), SessionError>;

/// Entrée de la table de sélection des sessions
pub struct CaptureSessionEntry {
    pub is_supported: IsStreamConfigSupportedFn,
    pub create: CreateCaptureSessionFn,
}

/// Table des sessions intégrées, consultée dans l'ordre. La session de base
/// ferme la liste et accepte toute configuration valide.
pub fn builtin_capture_session_entries() -> Vec<CaptureSessionEntry> {
    vec![
        CaptureSessionEntry {
            is_supported: DualIrCaptureSession::is_stream_configuration_supported,
            create: DualIrCaptureSession::create,
        },
        CaptureSessionEntry {
            is_supported: RgbirdCaptureSession::is_stream_configuration_supported,
            create: RgbirdCaptureSession::create,
        },
        CaptureSessionEntry {
            is_supported: HdrplusCaptureSession::is_stream_configuration_supported,
            create: HdrplusCaptureSession::create,
        },
        CaptureSessionEntry {
            is_supported: BasicCaptureSession::is_stream_configuration_supported,
            create: BasicCaptureSession::create,
        },
    ]
}

/// Sélectionne et crée la session de capture pour une configuration: les
/// candidats externes d'abord, puis la table intégrée.
pub fn create_capture_session(
    external_entries: &[CaptureSessionEntry],
    params: &CaptureSessionParams,
    stream_config: &StreamConfiguration,
    process_capture_result: ProcessCaptureResultFn,
    notify: NotifyFn,
) -> Result<(Box<dyn CaptureSession>, Vec<HalStream>), SessionError> {
    validate_stream_configuration(stream_config)?;

    let builtin = builtin_capture_session_entries();
    for entry in external_entries.iter().chain(builtin.iter()) {
        if (entry.is_supported)(&params.device_session, stream_config) {
            return (entry.create)(
                params,
                stream_config,
                process_capture_result,
                notify,
            );
        }
    }

    error!("Aucune session ne supporte la configuration de flux");
    Err(SessionError::BadValue(
        "Configuration de flux non supportée".to_string(),
    ))
}

/// Rappels de chaîne alimentant l'ordonnanceur de remise: les résultats
/// rejoignent leurs pistes, les obturations et les erreurs leurs files.
pub(crate) fn make_chain_callbacks(
    dispatcher: &Arc<ResultDispatcher>,
) -> (ProcessCaptureResultFn, NotifyFn) {
    let result_dispatcher = dispatcher.clone();
    let process_capture_result: ProcessCaptureResultFn = Arc::new(move |result| {
        if let Err(e) = result_dispatcher.add_result(result) {
            error!("Dépôt d'un résultat à l'ordonnanceur échoué: {}", e);
        }
    });

    let notify_dispatcher = dispatcher.clone();
    let notify: NotifyFn = Arc::new(move |message| match message {
        NotifyMessage::Shutter(shutter) => {
            notify_dispatcher.add_shutter(shutter.frame_number, shutter.timestamp_ns);
        }
        NotifyMessage::Error(error) => {
            notify_dispatcher.add_error(error);
        }
    });

    (process_capture_result, notify)
}

/// Vérifie que chaque flux du framework apparaît dans la configuration du
/// bloc
pub(crate) fn verify_all_streams_configured(
    stream_config: &StreamConfiguration,
    block_config: &StreamConfiguration,
) -> Result<(), SessionError> {
    let configured: HashSet<i32> = block_config.streams.iter().map(|stream| stream.id).collect();
    for stream in &stream_config.streams {
        if !configured.contains(&stream.id) {
            return Err(SessionError::Internal(format!(
                "Flux {} absent de la configuration du bloc",
                stream.id
            )));
        }
    }
    Ok(())
}

/// Retire de la liste des flux HAL ceux qui n'existent pas dans la
/// configuration du framework: les flux internes restent invisibles.
pub(crate) fn purge_hal_configured_streams(
    stream_config: &StreamConfiguration,
    hal_streams: Vec<HalStream>,
) -> Vec<HalStream> {
    let framework_ids: HashSet<i32> =
        stream_config.streams.iter().map(|stream| stream.id).collect();
    let purged: Vec<HalStream> = hal_streams
        .into_iter()
        .filter(|hal_stream| framework_ids.contains(&hal_stream.id))
        .collect();
    info!(
        "{} flux HAL visibles après purge des flux internes",
        purged.len()
    );
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::Stream;

    #[test]
    fn test_purge_removes_internal_streams() {
        let stream_config = StreamConfiguration {
            streams: vec![
                Stream {
                    id: 0,
                    width: 640,
                    height: 480,
                    ..Default::default()
                },
                Stream {
                    id: 1,
                    width: 640,
                    height: 480,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let hal_streams = vec![
            HalStream {
                id: 0,
                ..Default::default()
            },
            HalStream {
                id: 1,
                ..Default::default()
            },
            HalStream {
                id: argos_core::stream::HAL_INTERNAL_STREAM_ID_START,
                ..Default::default()
            },
        ];

        let purged = purge_hal_configured_streams(&stream_config, hal_streams);
        assert_eq!(purged.len(), 2);
        assert!(purged
            .iter()
            .all(|hal_stream| hal_stream.id < argos_core::stream::HAL_INTERNAL_STREAM_ID_START));
    }

    #[test]
    fn test_verify_all_streams_configured() {
        let stream_config = StreamConfiguration {
            streams: vec![Stream {
                id: 3,
                width: 640,
                height: 480,
                ..Default::default()
            }],
            ..Default::default()
        };

        let missing = StreamConfiguration::default();
        assert!(verify_all_streams_configured(&stream_config, &missing).is_err());
        assert!(verify_all_streams_configured(&stream_config, &stream_config).is_ok());
    }
}
