//! Utilitaires de classification des flux et requêtes et de retouche des
//! métadonnées, partagés par les processeurs et les sessions.

use log::debug;

use argos_core::metadata::{tags, vendor_tags};
use argos_core::stream::usage;
use argos_core::{
    CaptureRequest, DataSpace, Metadata, PixelFormat, Stream, StreamConfiguration,
    StreamConfigurationMode, StreamType,
};

use crate::process_block::ProcessBlockRequest;

/// Fréquence maximale supportée par le traitement en rafale HDR+
const HDRPLUS_SENSOR_MAX_FPS: i32 = 30;

/// Vrai si le flux est une sortie de prévisualisation (composition ou
/// texture GPU)
pub fn is_preview_stream(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Output
        && (stream.usage & (usage::HW_COMPOSER | usage::HW_TEXTURE)) != 0
}

/// Vrai si le flux alimente un encodeur vidéo
pub fn is_video_stream(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Output && (stream.usage & usage::VIDEO_ENCODER) != 0
}

/// Vrai si le flux est un cliché JPEG
pub fn is_jpeg_snapshot_stream(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Output
        && stream.format == PixelFormat::Blob
        && stream.data_space == DataSpace::Jfif
}

/// Vrai si le flux est une carte de profondeur
pub fn is_depth_stream(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Output
        && stream.format == PixelFormat::Y16
        && stream.data_space == DataSpace::Depth
}

/// Vrai si le flux est un cliché YUV (sortie YUV ni prévisualisation ni
/// vidéo)
pub fn is_yuv_snapshot_stream(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Output
        && stream.format == PixelFormat::Ycbcr420_888
        && !is_preview_stream(stream)
        && !is_video_stream(stream)
}

/// Vrai si le flux est un RAW à espace colorimétrique arbitraire
pub fn is_arbitrary_data_space_raw_stream(stream: &Stream) -> bool {
    (stream.format == PixelFormat::Raw10 || stream.format == PixelFormat::Raw16)
        && stream.data_space == DataSpace::Arbitrary
}

/// Vrai si la caméra porte une matrice de Bayer
pub fn is_bayer_camera(characteristics: &Metadata) -> bool {
    match characteristics.get_u8(tags::SENSOR_INFO_COLOR_FILTER_ARRANGEMENT) {
        Some(cfa) => cfa <= tags::COLOR_FILTER_ARRANGEMENT_BGGR,
        None => false,
    }
}

/// Vrai si la caméra est monochrome (capteurs infrarouges inclus)
pub fn is_mono_camera(characteristics: &Metadata) -> bool {
    characteristics.get_u8(tags::SENSOR_INFO_COLOR_FILTER_ARRANGEMENT)
        == Some(tags::COLOR_FILTER_ARRANGEMENT_MONO)
}

/// Vrai si la requête remplit toutes les conditions d'un cliché HDR+:
/// intention de capture fixe, ZSL activé, chaîne de qualité au maximum,
/// flash éteint, déclenchement AF au repos, et plus que la seule
/// prévisualisation demandée.
pub fn is_request_hdrplus_compatible(request: &CaptureRequest, preview_stream_id: i32) -> bool {
    let settings = match &request.settings {
        Some(settings) => settings,
        None => return false,
    };

    if settings.get_u8(tags::CONTROL_CAPTURE_INTENT) != Some(tags::CAPTURE_INTENT_STILL_CAPTURE) {
        return false;
    }
    if settings.get_u8(tags::CONTROL_ENABLE_ZSL) != Some(tags::ENABLE_ZSL_TRUE) {
        return false;
    }
    if settings.get_u8(tags::NOISE_REDUCTION_MODE) != Some(tags::MODE_HIGH_QUALITY) {
        return false;
    }
    if settings.get_u8(tags::EDGE_MODE) != Some(tags::MODE_HIGH_QUALITY) {
        return false;
    }
    if settings.get_u8(tags::COLOR_CORRECTION_ABERRATION_MODE) != Some(tags::MODE_HIGH_QUALITY) {
        return false;
    }
    match settings.get_u8(tags::CONTROL_AE_MODE) {
        Some(tags::AE_MODE_ON) | Some(tags::AE_MODE_ON_AUTO_FLASH) => {}
        _ => return false,
    }
    if settings.get_u8(tags::CONTROL_AWB_MODE) != Some(tags::AWB_MODE_AUTO) {
        return false;
    }
    if settings.get_u8(tags::CONTROL_EFFECT_MODE) != Some(tags::EFFECT_MODE_OFF) {
        return false;
    }
    match settings.get_u8(tags::CONTROL_MODE) {
        Some(tags::CONTROL_MODE_AUTO) | Some(tags::CONTROL_MODE_USE_SCENE_MODE) => {}
        _ => return false,
    }
    if settings.get_u8(tags::FLASH_MODE) != Some(tags::FLASH_MODE_OFF) {
        return false;
    }
    if settings.get_u8(tags::TONEMAP_MODE) != Some(tags::MODE_HIGH_QUALITY) {
        return false;
    }
    if settings.get_u8(tags::CONTROL_AF_TRIGGER) != Some(tags::AF_TRIGGER_IDLE) {
        return false;
    }

    // Une requête qui ne demande que la prévisualisation n'est pas un cliché
    if preview_stream_id != -1
        && request.output_buffers.len() == 1
        && request.output_buffers[0].stream_id == preview_stream_id
    {
        debug!(
            "Trame {}: seule la prévisualisation est demandée",
            request.frame_number
        );
        return false;
    }

    true
}

/// Vrai si la configuration de flux est compatible avec la chaîne HDR+:
/// mode normal, prévisualisation présente, au moins un cliché JPEG ou YUV,
/// ni profondeur ni vidéo ni RAW, pas de mélange logique/physique, fps
/// borné et HDR+ non désactivé par les paramètres de session.
pub fn is_stream_hdrplus_compatible(
    stream_config: &StreamConfiguration,
    characteristics: &Metadata,
) -> bool {
    let payload_frames = characteristics
        .get_i32(vendor_tags::HDRPLUS_PAYLOAD_FRAMES)
        .unwrap_or(0);
    if payload_frames <= 0 {
        return false;
    }

    if stream_config.operation_mode != StreamConfigurationMode::Normal {
        return false;
    }

    if let Some(session_params) = &stream_config.session_params {
        if session_params.get_u8(vendor_tags::HDRPLUS_DISABLED) == Some(1) {
            debug!("HDR+ désactivé par les paramètres de session");
            return false;
        }
        if let Some(fps_range) = session_params.get_i32_slice(tags::CONTROL_AE_TARGET_FPS_RANGE) {
            if fps_range.len() == 2 && fps_range[1] > HDRPLUS_SENSOR_MAX_FPS {
                debug!("Fréquence {} au-delà du support HDR+", fps_range[1]);
                return false;
            }
        }
    }

    let mut has_preview = false;
    let mut has_jpeg = false;
    let mut yuv_count = 0;
    let mut has_logical = false;
    let mut has_physical = false;
    let mut last_physical_id = None;

    for stream in &stream_config.streams {
        if is_preview_stream(stream) {
            has_preview = true;
        } else if is_jpeg_snapshot_stream(stream) {
            has_jpeg = true;
        } else if is_depth_stream(stream) || is_video_stream(stream) {
            return false;
        } else if is_arbitrary_data_space_raw_stream(stream) {
            return false;
        } else if is_yuv_snapshot_stream(stream) {
            yuv_count += 1;
        } else {
            return false;
        }

        if stream.is_physical_camera_stream {
            if has_physical && last_physical_id != Some(stream.physical_camera_id) {
                return false;
            }
            has_physical = true;
            last_physical_id = Some(stream.physical_camera_id);
        } else {
            has_logical = true;
        }
    }

    if !has_preview {
        return false;
    }
    if !has_jpeg && yuv_count == 0 {
        return false;
    }
    if has_logical && has_physical {
        return false;
    }

    true
}

/// Prépare les réglages d'une requête temps réel alimentant l'anneau HDR+:
/// AE hybride, détection de visages au moins simple, carte d'ombrage active
pub fn modify_realtime_request_for_hdrplus(settings: &mut Metadata, hybrid_ae_enable: bool) {
    settings.set_i32(
        vendor_tags::HYBRID_AE_ENABLED,
        &[if hybrid_ae_enable { 1 } else { 0 }],
    );

    if settings.get_u8(tags::STATISTICS_FACE_DETECT_MODE) == Some(tags::FACE_DETECT_MODE_OFF) {
        settings.set_u8(
            tags::STATISTICS_FACE_DETECT_MODE,
            tags::FACE_DETECT_MODE_SIMPLE,
        );
    }

    force_lens_shading_map_mode_on(settings);
}

/// Force la production de la carte d'ombrage d'objectif
pub fn force_lens_shading_map_mode_on(settings: &mut Metadata) {
    if settings.get_u8(tags::STATISTICS_LENS_SHADING_MAP_MODE)
        == Some(tags::LENS_SHADING_MAP_MODE_OFF)
    {
        settings.set_u8(
            tags::STATISTICS_LENS_SHADING_MAP_MODE,
            tags::LENS_SHADING_MAP_MODE_ON,
        );
    }
}

/// Retire d'un résultat la carte d'ombrage produite pour l'usage interne
pub fn remove_ls_info_from_result(metadata: &mut Metadata) {
    if metadata.get_u8(tags::STATISTICS_LENS_SHADING_MAP_MODE).is_some() {
        metadata.set_u8(
            tags::STATISTICS_LENS_SHADING_MAP_MODE,
            tags::LENS_SHADING_MAP_MODE_OFF,
        );
    }
    metadata.erase(tags::STATISTICS_LENS_SHADING_MAP);
}

/// Retire d'un résultat les données de détection de visages produites pour
/// l'usage interne
pub fn remove_fd_info_from_result(metadata: &mut Metadata) {
    if metadata.get_u8(tags::STATISTICS_FACE_DETECT_MODE).is_some() {
        metadata.set_u8(tags::STATISTICS_FACE_DETECT_MODE, tags::FACE_DETECT_MODE_OFF);
    }
    metadata.erase(tags::STATISTICS_FACE_RECTANGLES);
    metadata.erase(tags::STATISTICS_FACE_SCORES);
}

/// Retire la famille des tags JPEG d'un jeu de métadonnées empruntées
pub fn remove_jpeg_metadata(metadata: &mut Metadata) {
    const JPEG_TAGS: [u32; 7] = [
        tags::JPEG_THUMBNAIL_SIZE,
        tags::JPEG_ORIENTATION,
        tags::JPEG_QUALITY,
        tags::JPEG_THUMBNAIL_QUALITY,
        tags::JPEG_GPS_COORDINATES,
        tags::JPEG_GPS_PROCESSING_METHOD,
        tags::JPEG_GPS_TIMESTAMP,
    ];
    for tag in JPEG_TAGS {
        metadata.erase(tag);
    }
}

/// Marque le résultat comme hors ZSL avant remise au framework
pub fn set_enable_zsl_metadata(metadata: &mut Metadata, enable: bool) {
    metadata.set_u8(
        tags::CONTROL_ENABLE_ZSL,
        if enable {
            tags::ENABLE_ZSL_TRUE
        } else {
            tags::ENABLE_ZSL_FALSE
        },
    );
}

/// Vérifie que chaque buffer de sortie de la requête de session restante
/// est couvert par une des requêtes de bloc
pub fn are_all_remaining_buffers_requested(
    block_requests: &[ProcessBlockRequest],
    remaining_session_request: &CaptureRequest,
) -> bool {
    for buffer in &remaining_session_request.output_buffers {
        let covered = block_requests.iter().any(|block_request| {
            block_request.request.output_buffers.iter().any(|candidate| {
                candidate.stream_id == buffer.stream_id && candidate.buffer_id == buffer.buffer_id
            })
        });
        if !covered {
            debug!(
                "Buffer non couvert: flux {} buffer {}",
                buffer.stream_id, buffer.buffer_id
            );
            return false;
        }
    }
    true
}

/// Construit des réglages HDR+ compatibles à partir d'une base, pour les
/// tests et les modèles de requête
pub fn make_hdrplus_still_settings(base: &Metadata) -> Metadata {
    let mut settings = base.clone();
    settings.set_u8(
        tags::CONTROL_CAPTURE_INTENT,
        tags::CAPTURE_INTENT_STILL_CAPTURE,
    );
    settings.set_u8(tags::CONTROL_ENABLE_ZSL, tags::ENABLE_ZSL_TRUE);
    settings.set_u8(tags::NOISE_REDUCTION_MODE, tags::MODE_HIGH_QUALITY);
    settings.set_u8(tags::EDGE_MODE, tags::MODE_HIGH_QUALITY);
    settings.set_u8(
        tags::COLOR_CORRECTION_ABERRATION_MODE,
        tags::MODE_HIGH_QUALITY,
    );
    settings.set_u8(tags::CONTROL_AE_MODE, tags::AE_MODE_ON);
    settings.set_u8(tags::CONTROL_AWB_MODE, tags::AWB_MODE_AUTO);
    settings.set_u8(tags::CONTROL_EFFECT_MODE, tags::EFFECT_MODE_OFF);
    settings.set_u8(tags::CONTROL_MODE, tags::CONTROL_MODE_AUTO);
    settings.set_u8(tags::FLASH_MODE, tags::FLASH_MODE_OFF);
    settings.set_u8(tags::TONEMAP_MODE, tags::MODE_HIGH_QUALITY);
    settings.set_u8(tags::CONTROL_AF_TRIGGER, tags::AF_TRIGGER_IDLE);
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::StreamBuffer;

    fn make_preview_stream(id: i32) -> Stream {
        Stream {
            id,
            stream_type: StreamType::Output,
            width: 1280,
            height: 720,
            format: PixelFormat::Ycbcr420_888,
            usage: usage::HW_TEXTURE,
            ..Default::default()
        }
    }

    fn make_jpeg_stream(id: i32) -> Stream {
        Stream {
            id,
            stream_type: StreamType::Output,
            width: 4032,
            height: 3024,
            format: PixelFormat::Blob,
            data_space: DataSpace::Jfif,
            ..Default::default()
        }
    }

    #[test]
    fn test_stream_classification() {
        assert!(is_preview_stream(&make_preview_stream(0)));
        assert!(is_jpeg_snapshot_stream(&make_jpeg_stream(1)));

        let depth = Stream {
            format: PixelFormat::Y16,
            data_space: DataSpace::Depth,
            ..Default::default()
        };
        assert!(is_depth_stream(&depth));

        let video = Stream {
            usage: usage::VIDEO_ENCODER,
            ..Default::default()
        };
        assert!(is_video_stream(&video));
    }

    #[test]
    fn test_hdrplus_stream_compatibility() {
        let mut characteristics = Metadata::new();
        characteristics.set_i32(vendor_tags::HDRPLUS_PAYLOAD_FRAMES, &[3]);

        let config = StreamConfiguration {
            streams: vec![make_preview_stream(0), make_jpeg_stream(1)],
            ..Default::default()
        };
        assert!(is_stream_hdrplus_compatible(&config, &characteristics));

        // Sans trames de charge utile annoncées
        assert!(!is_stream_hdrplus_compatible(&config, &Metadata::new()));

        // Sans prévisualisation
        let jpeg_only = StreamConfiguration {
            streams: vec![make_jpeg_stream(1)],
            ..Default::default()
        };
        assert!(!is_stream_hdrplus_compatible(&jpeg_only, &characteristics));

        // Désactivation par paramètre de session
        let mut session_params = Metadata::new();
        session_params.set_u8(vendor_tags::HDRPLUS_DISABLED, 1);
        let disabled = StreamConfiguration {
            streams: vec![make_preview_stream(0), make_jpeg_stream(1)],
            session_params: Some(session_params),
            ..Default::default()
        };
        assert!(!is_stream_hdrplus_compatible(&disabled, &characteristics));
    }

    #[test]
    fn test_hdrplus_request_compatibility() {
        let settings = make_hdrplus_still_settings(&Metadata::new());
        let request = CaptureRequest {
            frame_number: 1,
            settings: Some(settings.clone()),
            output_buffers: vec![
                StreamBuffer {
                    stream_id: 0,
                    ..Default::default()
                },
                StreamBuffer {
                    stream_id: 1,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(is_request_hdrplus_compatible(&request, 0));

        // Seule la prévisualisation demandée
        let preview_only = CaptureRequest {
            frame_number: 2,
            settings: Some(settings.clone()),
            output_buffers: vec![StreamBuffer {
                stream_id: 0,
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(!is_request_hdrplus_compatible(&preview_only, 0));

        // Flash actif
        let mut flash_settings = settings;
        flash_settings.set_u8(tags::FLASH_MODE, 1);
        let flash_request = CaptureRequest {
            frame_number: 3,
            settings: Some(flash_settings),
            output_buffers: request.output_buffers.clone(),
            ..Default::default()
        };
        assert!(!is_request_hdrplus_compatible(&flash_request, 0));
    }

    #[test]
    fn test_fd_ls_strip() {
        let mut metadata = Metadata::new();
        metadata.set_u8(
            tags::STATISTICS_FACE_DETECT_MODE,
            tags::FACE_DETECT_MODE_SIMPLE,
        );
        metadata.set_i32(tags::STATISTICS_FACE_RECTANGLES, &[0, 0, 10, 10]);
        metadata.set_i32(tags::STATISTICS_FACE_SCORES, &[90]);
        metadata.set_u8(
            tags::STATISTICS_LENS_SHADING_MAP_MODE,
            tags::LENS_SHADING_MAP_MODE_ON,
        );
        metadata.set_f32(tags::STATISTICS_LENS_SHADING_MAP, &[1.0, 1.0, 1.0, 1.0]);

        remove_fd_info_from_result(&mut metadata);
        remove_ls_info_from_result(&mut metadata);

        assert_eq!(
            metadata.get_u8(tags::STATISTICS_FACE_DETECT_MODE),
            Some(tags::FACE_DETECT_MODE_OFF)
        );
        assert!(metadata.get(tags::STATISTICS_FACE_RECTANGLES).is_none());
        assert!(metadata.get(tags::STATISTICS_FACE_SCORES).is_none());
        assert!(metadata.get(tags::STATISTICS_LENS_SHADING_MAP).is_none());
    }

    #[test]
    fn test_remaining_buffers_coverage() {
        use crate::process_block::ProcessBlockRequest;

        let remaining = CaptureRequest {
            frame_number: 1,
            output_buffers: vec![
                StreamBuffer {
                    stream_id: 0,
                    buffer_id: 1,
                    ..Default::default()
                },
                StreamBuffer {
                    stream_id: 1,
                    buffer_id: 2,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let covering = vec![ProcessBlockRequest {
            request_id: 0,
            request: remaining.clone(),
        }];
        assert!(are_all_remaining_buffers_requested(&covering, &remaining));

        let partial = vec![ProcessBlockRequest {
            request_id: 0,
            request: CaptureRequest {
                frame_number: 1,
                output_buffers: vec![StreamBuffer {
                    stream_id: 0,
                    buffer_id: 1,
                    ..Default::default()
                }],
                ..Default::default()
            },
        }];
        assert!(!are_all_remaining_buffers_requested(&partial, &remaining));
    }
}
