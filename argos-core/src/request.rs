use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::buffer::StreamBuffer;
use crate::metadata::Metadata;

/// Modèle de réglages par défaut demandé par le framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
    Manual,
}

/// Requête de capture pour une trame.
///
/// Les numéros de trame sont strictement croissants au sein d'une session.
/// La première requête avec des réglages non nuls établit la base "sticky"
/// héritée par les requêtes suivantes sans réglages.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    /// Numéro de trame
    pub frame_number: u32,

    /// Réglages de la requête, absents si hérités de la base sticky
    pub settings: Option<Metadata>,

    /// Buffers d'entrée (retraitement, rafales)
    pub input_buffers: Vec<StreamBuffer>,

    /// Une métadonnée par buffer d'entrée, dans le même ordre
    pub input_buffer_metadata: Vec<Option<Metadata>>,

    /// Buffers de sortie demandés
    pub output_buffers: Vec<StreamBuffer>,

    /// Réglages par caméra physique pour les dispositifs logiques
    pub physical_camera_settings: BTreeMap<u32, Metadata>,
}

/// Résultat de capture pour une trame. Sur l'ensemble des résultats d'une
/// trame, chaque buffer demandé apparaît exactement une fois et la
/// métadonnée arrive exactement une fois à l'indice partiel final.
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    /// Numéro de trame
    pub frame_number: u32,

    /// Métadonnées de résultat, complètes ou partielles
    pub result_metadata: Option<Metadata>,

    /// Indice de résultat partiel, à base 1. La métadonnée finale porte
    /// l'indice égal au nombre total de partiels annoncé.
    pub partial_result: u32,

    /// Buffers de sortie complétés
    pub output_buffers: Vec<StreamBuffer>,

    /// Buffers d'entrée restitués
    pub input_buffers: Vec<StreamBuffer>,

    /// Métadonnées par caméra physique
    pub physical_metadata: BTreeMap<u32, Metadata>,
}

/// Catégorie d'erreur notifiée au framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Erreur fatale, la session doit être détruite
    Device,

    /// Trame entière abandonnée, aucun rapport par buffer à attendre
    Request,

    /// Métadonnées perdues, les buffers peuvent encore arriver
    Result,

    /// Buffer d'un flux en erreur pour cette trame
    Buffer,
}

/// Message d'obturation: la capture de la trame a démarré
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutterMessage {
    /// Numéro de trame
    pub frame_number: u32,

    /// Horodatage monotone du début d'exposition, en nanosecondes
    pub timestamp_ns: u64,
}

/// Message d'erreur
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Numéro de trame concernée
    pub frame_number: u32,

    /// Flux concerné pour une erreur de buffer
    pub error_stream_id: Option<i32>,

    /// Catégorie de l'erreur
    pub error_code: ErrorCode,
}

/// Notification asynchrone remontée au framework
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMessage {
    Shutter(ShutterMessage),
    Error(ErrorMessage),
}

impl NotifyMessage {
    /// Numéro de trame porté par le message
    pub fn frame_number(&self) -> u32 {
        match self {
            NotifyMessage::Shutter(shutter) => shutter.frame_number,
            NotifyMessage::Error(error) => error.frame_number,
        }
    }
}

impl CaptureRequest {
    /// Vrai si la requête contient un buffer de sortie pour le flux donné
    pub fn has_output_stream(&self, stream_id: i32) -> bool {
        self.output_buffers
            .iter()
            .any(|buffer| buffer.stream_id == stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::StreamBuffer;

    #[test]
    fn test_notify_frame_number() {
        let shutter = NotifyMessage::Shutter(ShutterMessage {
            frame_number: 12,
            timestamp_ns: 1_000,
        });
        assert_eq!(shutter.frame_number(), 12);

        let error = NotifyMessage::Error(ErrorMessage {
            frame_number: 13,
            error_stream_id: Some(2),
            error_code: ErrorCode::Buffer,
        });
        assert_eq!(error.frame_number(), 13);
    }

    #[test]
    fn test_has_output_stream() {
        let mut request = CaptureRequest {
            frame_number: 1,
            ..Default::default()
        };
        request.output_buffers.push(StreamBuffer {
            stream_id: 4,
            buffer_id: 1,
            ..Default::default()
        });

        assert!(request.has_output_stream(4));
        assert!(!request.has_output_stream(5));
    }
}
