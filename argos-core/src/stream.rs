use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// Début de la plage d'identifiants réservée aux flux internes du HAL.
/// Les identifiants du framework sont toujours en dessous de cette valeur.
pub const HAL_INTERNAL_STREAM_ID_START: i32 = 1 << 16;

/// Début de la plage d'identifiants internes imposés par le HWL. Un flux
/// enregistré avec un identifiant au-delà de cette borne garde son
/// identifiant tel quel.
pub const IMPLEMENTATION_DEFINED_INTERNAL_STREAM_ID_START: i32 = 3 << 16;

/// Identifiant de flux invalide
pub const INVALID_STREAM_ID: i32 = -1;

/// Direction d'un flux
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamType {
    /// Flux de sortie (producteur: capteur/ISP, consommateur: client)
    Output,

    /// Flux d'entrée (retraitement)
    Input,
}

impl Default for StreamType {
    fn default() -> Self {
        StreamType::Output
    }
}

/// Format de pixel supporté
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Format choisi par le HWL à la configuration
    ImplementationDefined,
    Ycbcr420_888,
    Blob,
    Raw10,
    Raw16,
    Y8,
    Y16,
    Rgba8888,
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::ImplementationDefined
    }
}

/// Rotation appliquée au flux
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamRotation {
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl Default for StreamRotation {
    fn default() -> Self {
        StreamRotation::Rotation0
    }
}

/// Espace colorimétrique d'un flux
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSpace {
    Unknown,
    /// Contenu arbitraire, interprété par le producteur et le consommateur
    Arbitrary,
    /// JPEG
    Jfif,
    /// Carte de profondeur
    Depth,
}

impl Default for DataSpace {
    fn default() -> Self {
        DataSpace::Unknown
    }
}

/// Drapeaux d'usage d'un buffer, combinables par OU binaire
pub mod usage {
    /// Lecture CPU fréquente
    pub const SW_READ_OFTEN: u64 = 1 << 0;

    /// Écriture CPU fréquente
    pub const SW_WRITE_OFTEN: u64 = 1 << 1;

    /// Échantillonnage par le GPU (prévisualisation)
    pub const HW_TEXTURE: u64 = 1 << 2;

    /// Composition d'affichage (prévisualisation)
    pub const HW_COMPOSER: u64 = 1 << 3;

    /// Encodeur vidéo
    pub const VIDEO_ENCODER: u64 = 1 << 4;

    /// Cache zéro-délai géré par le framework
    pub const CAMERA_ZSL: u64 = 1 << 5;

    /// Écriture par le bloc caméra
    pub const CAMERA_WRITE: u64 = 1 << 6;

    /// Lecture par le bloc caméra
    pub const CAMERA_READ: u64 = 1 << 7;
}

/// Description d'un canal d'image configuré par le framework ou enregistré
/// en interne
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stream {
    /// Identifiant du flux, unique au sein d'une configuration
    pub id: i32,

    /// Direction du flux
    pub stream_type: StreamType,

    /// Largeur en pixels
    pub width: u32,

    /// Hauteur en pixels
    pub height: u32,

    /// Format de pixel demandé
    pub format: PixelFormat,

    /// Drapeaux d'usage demandés par le consommateur
    pub usage: u64,

    /// Rotation à appliquer
    pub rotation: StreamRotation,

    /// Espace colorimétrique
    pub data_space: DataSpace,

    /// Vrai si le flux cible une caméra physique précise
    pub is_physical_camera_stream: bool,

    /// Identifiant de la caméra physique ciblée, significatif uniquement si
    /// `is_physical_camera_stream` est vrai
    pub physical_camera_id: u32,
}

/// Mode d'opération d'une configuration de flux
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamConfigurationMode {
    Normal,
    ConstrainedHighSpeed,
}

impl Default for StreamConfigurationMode {
    fn default() -> Self {
        StreamConfigurationMode::Normal
    }
}

/// Configuration de flux reçue du framework. Immuable pour la durée de la
/// session une fois créée.
#[derive(Debug, Clone, Default)]
pub struct StreamConfiguration {
    /// Flux configurés, dans l'ordre du framework
    pub streams: Vec<Stream>,

    /// Mode d'opération
    pub operation_mode: StreamConfigurationMode,

    /// Paramètres de session opaques
    pub session_params: Option<Metadata>,

    /// Compteur de configuration, strictement croissant
    pub stream_config_counter: u32,
}

/// Réalisation d'un flux choisie par le HAL après configuration des
/// pipelines. Immuable une fois produite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HalStream {
    /// Identifiant du flux configuré
    pub id: i32,

    /// Format retenu par le HAL
    pub override_format: PixelFormat,

    /// Drapeaux d'usage côté producteur
    pub producer_usage: u64,

    /// Drapeaux d'usage côté consommateur
    pub consumer_usage: u64,

    /// Nombre maximal de buffers simultanément en vol
    pub max_buffers: u32,

    /// Espace colorimétrique retenu par le HAL
    pub override_data_space: DataSpace,

    /// Vrai si le flux cible une caméra physique précise
    pub is_physical_camera_stream: bool,

    /// Identifiant de la caméra physique ciblée
    pub physical_camera_id: u32,
}

impl Stream {
    /// Vrai si l'identifiant appartient à la plage interne du HAL
    pub fn is_internal_id(id: i32) -> bool {
        id >= HAL_INTERNAL_STREAM_ID_START
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_id_range() {
        assert!(!Stream::is_internal_id(0));
        assert!(!Stream::is_internal_id(42));
        assert!(Stream::is_internal_id(HAL_INTERNAL_STREAM_ID_START));
        assert!(Stream::is_internal_id(
            IMPLEMENTATION_DEFINED_INTERNAL_STREAM_ID_START
        ));
    }

    #[test]
    fn test_usage_flags_compose() {
        let flags = usage::HW_TEXTURE | usage::HW_COMPOSER;
        assert_ne!(flags & usage::HW_TEXTURE, 0);
        assert_ne!(flags & usage::HW_COMPOSER, 0);
        assert_eq!(flags & usage::VIDEO_ENCODER, 0);
    }
}
