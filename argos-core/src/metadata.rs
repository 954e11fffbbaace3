use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifiants des tags standards consommés par le moteur de session.
/// Les valeurs suivent l'ordre de déclaration, seule l'unicité compte.
pub mod tags {
    pub const CONTROL_CAPTURE_INTENT: u32 = 0x0001;
    pub const CONTROL_ENABLE_ZSL: u32 = 0x0002;
    pub const CONTROL_AE_MODE: u32 = 0x0003;
    pub const CONTROL_AWB_MODE: u32 = 0x0004;
    pub const CONTROL_EFFECT_MODE: u32 = 0x0005;
    pub const CONTROL_MODE: u32 = 0x0006;
    pub const CONTROL_AF_TRIGGER: u32 = 0x0007;
    pub const CONTROL_AE_TARGET_FPS_RANGE: u32 = 0x0008;
    pub const NOISE_REDUCTION_MODE: u32 = 0x0009;
    pub const EDGE_MODE: u32 = 0x000a;
    pub const COLOR_CORRECTION_ABERRATION_MODE: u32 = 0x000b;
    pub const FLASH_MODE: u32 = 0x000c;
    pub const TONEMAP_MODE: u32 = 0x000d;
    pub const SCALER_CROP_REGION: u32 = 0x000e;
    pub const SENSOR_TIMESTAMP: u32 = 0x000f;
    pub const SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE: u32 = 0x0010;
    pub const STATISTICS_FACE_DETECT_MODE: u32 = 0x0011;
    pub const STATISTICS_FACE_RECTANGLES: u32 = 0x0012;
    pub const STATISTICS_FACE_SCORES: u32 = 0x0013;
    pub const STATISTICS_LENS_SHADING_MAP_MODE: u32 = 0x0014;
    pub const STATISTICS_LENS_SHADING_MAP: u32 = 0x0015;
    pub const JPEG_THUMBNAIL_SIZE: u32 = 0x0016;
    pub const JPEG_ORIENTATION: u32 = 0x0017;
    pub const JPEG_QUALITY: u32 = 0x0018;
    pub const JPEG_THUMBNAIL_QUALITY: u32 = 0x0019;
    pub const JPEG_GPS_COORDINATES: u32 = 0x001a;
    pub const JPEG_GPS_PROCESSING_METHOD: u32 = 0x001b;
    pub const JPEG_GPS_TIMESTAMP: u32 = 0x001c;
    pub const REQUEST_PARTIAL_RESULT_COUNT: u32 = 0x001d;
    pub const CONTROL_ZOOM_RATIO: u32 = 0x001e;
    pub const SENSOR_INFO_COLOR_FILTER_ARRANGEMENT: u32 = 0x001f;
    pub const LOGICAL_MULTI_CAMERA_ACTIVE_PHYSICAL_ID: u32 = 0x0020;

    // Valeurs de CONTROL_CAPTURE_INTENT
    pub const CAPTURE_INTENT_CUSTOM: u8 = 0;
    pub const CAPTURE_INTENT_PREVIEW: u8 = 1;
    pub const CAPTURE_INTENT_STILL_CAPTURE: u8 = 2;
    pub const CAPTURE_INTENT_VIDEO_RECORD: u8 = 3;
    pub const CAPTURE_INTENT_VIDEO_SNAPSHOT: u8 = 4;
    pub const CAPTURE_INTENT_ZERO_SHUTTER_LAG: u8 = 5;

    // Valeurs booléennes de CONTROL_ENABLE_ZSL
    pub const ENABLE_ZSL_FALSE: u8 = 0;
    pub const ENABLE_ZSL_TRUE: u8 = 1;

    // Modes qualité partagés par NOISE_REDUCTION / EDGE / ABERRATION / TONEMAP
    pub const MODE_OFF: u8 = 0;
    pub const MODE_FAST: u8 = 1;
    pub const MODE_HIGH_QUALITY: u8 = 2;

    // Valeurs de CONTROL_AE_MODE
    pub const AE_MODE_OFF: u8 = 0;
    pub const AE_MODE_ON: u8 = 1;
    pub const AE_MODE_ON_AUTO_FLASH: u8 = 2;

    // Valeurs de CONTROL_AWB_MODE
    pub const AWB_MODE_OFF: u8 = 0;
    pub const AWB_MODE_AUTO: u8 = 1;

    // Valeurs de CONTROL_EFFECT_MODE
    pub const EFFECT_MODE_OFF: u8 = 0;

    // Valeurs de CONTROL_MODE
    pub const CONTROL_MODE_OFF: u8 = 0;
    pub const CONTROL_MODE_AUTO: u8 = 1;
    pub const CONTROL_MODE_USE_SCENE_MODE: u8 = 2;

    // Valeurs de FLASH_MODE
    pub const FLASH_MODE_OFF: u8 = 0;

    // Valeurs de CONTROL_AF_TRIGGER
    pub const AF_TRIGGER_IDLE: u8 = 0;
    pub const AF_TRIGGER_START: u8 = 1;

    // Valeurs de STATISTICS_FACE_DETECT_MODE
    pub const FACE_DETECT_MODE_OFF: u8 = 0;
    pub const FACE_DETECT_MODE_SIMPLE: u8 = 1;
    pub const FACE_DETECT_MODE_FULL: u8 = 2;

    // Valeurs de STATISTICS_LENS_SHADING_MAP_MODE
    pub const LENS_SHADING_MAP_MODE_OFF: u8 = 0;
    pub const LENS_SHADING_MAP_MODE_ON: u8 = 1;

    // Valeurs de SENSOR_INFO_COLOR_FILTER_ARRANGEMENT
    pub const COLOR_FILTER_ARRANGEMENT_RGGB: u8 = 0;
    pub const COLOR_FILTER_ARRANGEMENT_GRBG: u8 = 1;
    pub const COLOR_FILTER_ARRANGEMENT_GBRG: u8 = 2;
    pub const COLOR_FILTER_ARRANGEMENT_BGGR: u8 = 3;
    pub const COLOR_FILTER_ARRANGEMENT_RGB: u8 = 4;
    pub const COLOR_FILTER_ARRANGEMENT_MONO: u8 = 5;
}

/// Identifiants des tags vendeur. La section commence à une base réservée;
/// le HWL ne doit déclarer aucun tag dans cette plage.
pub mod vendor_tags {
    /// Base de la section vendeur réservée au HAL
    pub const HAL_VENDOR_SECTION_START: u32 = 0x8400_0000;

    pub const DEFAULT_PHYSICAL_CAM_ID: u32 = HAL_VENDOR_SECTION_START;
    pub const HYBRID_AE_ENABLED: u32 = HAL_VENDOR_SECTION_START + 1;
    pub const HDRPLUS_DISABLED: u32 = HAL_VENDOR_SECTION_START + 2;
    pub const HDRPLUS_PAYLOAD_FRAMES: u32 = HAL_VENDOR_SECTION_START + 3;
    pub const PROCESSING_MODE: u32 = HAL_VENDOR_SECTION_START + 4;
    pub const THERMAL_THROTTLING: u32 = HAL_VENDOR_SECTION_START + 5;
    pub const OUTPUT_INTENT: u32 = HAL_VENDOR_SECTION_START + 6;
    pub const AVAILABLE_NON_WARPED_YUV_SIZES: u32 = HAL_VENDOR_SECTION_START + 7;
    pub const NON_WARPED_YUV_STREAM_ID: u32 = HAL_VENDOR_SECTION_START + 8;
    pub const SENSOR_MODE_FULL_FOV: u32 = HAL_VENDOR_SECTION_START + 9;
    pub const NON_WARPED_CROP_REGION: u32 = HAL_VENDOR_SECTION_START + 10;
    pub const HDR_USAGE_MODE: u32 = HAL_VENDOR_SECTION_START + 11;

    /// Type de charge utile d'un tag vendeur
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum VendorTagType {
        Byte,
        Int32,
        Int64,
        Float,
    }

    /// Description d'un tag vendeur exposé au framework
    #[derive(Debug, Clone)]
    pub struct VendorTag {
        pub tag_id: u32,
        pub tag_name: &'static str,
        pub tag_type: VendorTagType,
    }

    /// Section de tags vendeur
    #[derive(Debug, Clone)]
    pub struct VendorTagSection {
        pub section_name: &'static str,
        pub tags: Vec<VendorTag>,
    }

    /// Sections vendeur publiées par le HAL. L'ordre des identifiants ne
    /// doit jamais changer entre versions.
    pub fn hal_vendor_tag_sections() -> Vec<VendorTagSection> {
        vec![
            VendorTagSection {
                section_name: "com.argos.logicalcamera",
                tags: vec![VendorTag {
                    tag_id: DEFAULT_PHYSICAL_CAM_ID,
                    tag_name: "DefaultPhysicalCamId",
                    tag_type: VendorTagType::Int32,
                }],
            },
            VendorTagSection {
                section_name: "com.argos.internal",
                tags: vec![
                    VendorTag {
                        tag_id: HYBRID_AE_ENABLED,
                        tag_name: "3a.hybrid_ae_enable",
                        tag_type: VendorTagType::Int32,
                    },
                    VendorTag {
                        tag_id: HDRPLUS_DISABLED,
                        tag_name: "request.disable_hdrplus",
                        tag_type: VendorTagType::Byte,
                    },
                    VendorTag {
                        tag_id: HDRPLUS_PAYLOAD_FRAMES,
                        tag_name: "hdrplus.PayloadFrames",
                        tag_type: VendorTagType::Int32,
                    },
                    VendorTag {
                        tag_id: PROCESSING_MODE,
                        tag_name: "ProcessingMode",
                        tag_type: VendorTagType::Byte,
                    },
                    VendorTag {
                        tag_id: THERMAL_THROTTLING,
                        tag_name: "thermal_throttling",
                        tag_type: VendorTagType::Byte,
                    },
                    VendorTag {
                        tag_id: OUTPUT_INTENT,
                        tag_name: "OutputIntent",
                        tag_type: VendorTagType::Byte,
                    },
                    VendorTag {
                        tag_id: AVAILABLE_NON_WARPED_YUV_SIZES,
                        tag_name: "AvailableNonWarpedYuvSizes",
                        tag_type: VendorTagType::Int32,
                    },
                    VendorTag {
                        tag_id: NON_WARPED_YUV_STREAM_ID,
                        tag_name: "NonWarpedYuvStreamId",
                        tag_type: VendorTagType::Int32,
                    },
                    VendorTag {
                        tag_id: SENSOR_MODE_FULL_FOV,
                        tag_name: "SensorModeFullFov",
                        tag_type: VendorTagType::Byte,
                    },
                    VendorTag {
                        tag_id: NON_WARPED_CROP_REGION,
                        tag_name: "NonWarpedCropRegion",
                        tag_type: VendorTagType::Int32,
                    },
                    VendorTag {
                        tag_id: HDR_USAGE_MODE,
                        tag_name: "hdr.UsageMode",
                        tag_type: VendorTagType::Byte,
                    },
                ],
            },
        ]
    }

    /// Retrouve le nom d'un tag vendeur, pour les journaux
    pub fn tag_name(tag_id: u32) -> Option<&'static str> {
        for section in hal_vendor_tag_sections() {
            for tag in section.tags {
                if tag.tag_id == tag_id {
                    return Some(tag.tag_name);
                }
            }
        }
        None
    }
}

/// Mode de traitement d'une requête interne
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// Résultat final, renvoyé au framework
    Final,

    /// Traitement intermédiaire; les métadonnées privées du HWL doivent
    /// être filtrées avant toute sortie
    Intermediate,
}

impl ProcessingMode {
    pub fn to_u8(self) -> u8 {
        match self {
            ProcessingMode::Final => 0,
            ProcessingMode::Intermediate => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProcessingMode::Final),
            1 => Some(ProcessingMode::Intermediate),
            _ => None,
        }
    }
}

/// Intention de sortie d'une requête, estampillée par la session pour
/// orienter le tuning du HWL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputIntent {
    Preview,
    Snapshot,
    Video,
    Zsl,
    VideoSnapshot,
}

impl OutputIntent {
    pub fn to_u8(self) -> u8 {
        match self {
            OutputIntent::Preview => 0,
            OutputIntent::Snapshot => 1,
            OutputIntent::Video => 2,
            OutputIntent::Zsl => 3,
            OutputIntent::VideoSnapshot => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OutputIntent::Preview),
            1 => Some(OutputIntent::Snapshot),
            2 => Some(OutputIntent::Video),
            3 => Some(OutputIntent::Zsl),
            4 => Some(OutputIntent::VideoSnapshot),
            _ => None,
        }
    }
}

/// Mode d'usage HDR annoncé dans les caractéristiques
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HdrUsageMode {
    Hdrplus,
    NonHdrplus,
    NonHdrplusHdrnet,
}

impl HdrUsageMode {
    pub fn to_u8(self) -> u8 {
        match self {
            HdrUsageMode::Hdrplus => 0,
            HdrUsageMode::NonHdrplus => 1,
            HdrUsageMode::NonHdrplusHdrnet => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(HdrUsageMode::Hdrplus),
            1 => Some(HdrUsageMode::NonHdrplus),
            2 => Some(HdrUsageMode::NonHdrplusHdrnet),
            _ => None,
        }
    }
}

/// Valeur typée d'une entrée de métadonnées
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Byte(Vec<u8>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Rational(Vec<(i32, i32)>),
}

/// Conteneur de métadonnées de capture: une table ordonnée tag → valeur.
///
/// Les réglages sont clonés à chaque éclatement de requête, jamais partagés
/// par référence entre blocs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: BTreeMap<u32, MetadataValue>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nombre d'entrées présentes
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dépose une valeur, en remplaçant l'entrée existante le cas échéant
    pub fn set(&mut self, tag: u32, value: MetadataValue) {
        self.entries.insert(tag, value);
    }

    pub fn set_u8(&mut self, tag: u32, value: u8) {
        self.set(tag, MetadataValue::Byte(vec![value]));
    }

    pub fn set_i32(&mut self, tag: u32, values: &[i32]) {
        self.set(tag, MetadataValue::Int32(values.to_vec()));
    }

    pub fn set_i64(&mut self, tag: u32, value: i64) {
        self.set(tag, MetadataValue::Int64(vec![value]));
    }

    pub fn set_f32(&mut self, tag: u32, values: &[f32]) {
        self.set(tag, MetadataValue::Float(values.to_vec()));
    }

    pub fn get(&self, tag: u32) -> Option<&MetadataValue> {
        self.entries.get(&tag)
    }

    /// Premier octet d'une entrée de type Byte
    pub fn get_u8(&self, tag: u32) -> Option<u8> {
        match self.entries.get(&tag) {
            Some(MetadataValue::Byte(values)) => values.first().copied(),
            _ => None,
        }
    }

    /// Premier entier d'une entrée de type Int32
    pub fn get_i32(&self, tag: u32) -> Option<i32> {
        match self.entries.get(&tag) {
            Some(MetadataValue::Int32(values)) => values.first().copied(),
            _ => None,
        }
    }

    /// Entrée Int32 complète
    pub fn get_i32_slice(&self, tag: u32) -> Option<&[i32]> {
        match self.entries.get(&tag) {
            Some(MetadataValue::Int32(values)) => Some(values.as_slice()),
            _ => None,
        }
    }

    /// Premier entier long d'une entrée de type Int64
    pub fn get_i64(&self, tag: u32) -> Option<i64> {
        match self.entries.get(&tag) {
            Some(MetadataValue::Int64(values)) => values.first().copied(),
            _ => None,
        }
    }

    /// Première valeur flottante d'une entrée de type Float
    pub fn get_f32(&self, tag: u32) -> Option<f32> {
        match self.entries.get(&tag) {
            Some(MetadataValue::Float(values)) => values.first().copied(),
            _ => None,
        }
    }

    /// Supprime une entrée. Renvoie vrai si l'entrée existait.
    pub fn erase(&mut self, tag: u32) -> bool {
        self.entries.remove(&tag).is_some()
    }

    /// Itère sur les paires (tag, valeur) en ordre croissant de tag
    pub fn iter(&self) -> impl Iterator<Item = (&u32, &MetadataValue)> {
        self.entries.iter()
    }

    /// Fusionne `other` dans `self`, les entrées de `other` l'emportent
    pub fn merge(&mut self, other: &Metadata) {
        for (tag, value) in other.iter() {
            self.entries.insert(*tag, value.clone());
        }
    }
}
