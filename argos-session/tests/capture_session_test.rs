//! Scénarios de bout en bout du moteur de session, pilotés à travers la
//! façade de dispositif et le HWL simulé.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use argos_core::metadata::{tags, vendor_tags};
use argos_core::stream::usage;
use argos_core::{
    BufferHandle, BufferStatus, CaptureRequest, CaptureResult, DataSpace, ErrorCode, Metadata,
    NotifyMessage, PixelFormat, Stream, StreamBuffer, StreamConfiguration,
};
use argos_hwl::{
    NotifyThrottlingFn, SimpleBufferAllocator, SimulatedDepthGenerator, SimulatedHwlSession,
    ThermalCallback, ThermalSeverity,
};
use argos_session::capture_session::SessionOptions;
use argos_session::hal_utils;
use argos_session::{CameraDeviceSession, SessionCallback};

#[derive(Debug)]
enum Event {
    Result(CaptureResult),
    Notify(NotifyMessage),
}

struct Harness {
    session: Arc<CameraDeviceSession>,
    events: mpsc::Receiver<Event>,
    throttle: Arc<parking_lot::Mutex<Option<NotifyThrottlingFn>>>,
}

impl Harness {
    fn new(hwl: Arc<SimulatedHwlSession>, with_depth_generator: bool) -> Self {
        let allocator = SimpleBufferAllocator::new();
        let depth_factory = with_depth_generator.then(|| {
            let factory: argos_hwl::DepthGeneratorFactory = Arc::new(|| {
                let generator: Arc<dyn argos_hwl::DepthGenerator> =
                    SimulatedDepthGenerator::new();
                generator
            });
            factory
        });

        let session = CameraDeviceSession::new(
            hwl.clone(),
            allocator.clone(),
            allocator,
            depth_factory,
            SessionOptions::default(),
        );

        let (event_tx, events) = mpsc::channel();
        let result_tx = event_tx.clone();

        // La paire thermique expose le rappel enregistré pour que les tests
        // injectent une sévérité
        let throttle: Arc<parking_lot::Mutex<Option<NotifyThrottlingFn>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let register_slot = throttle.clone();
        let unregister_slot = throttle.clone();
        let thermal_callback = ThermalCallback {
            register_thermal_changed_callback: Arc::new(move |notify_throttling| {
                *register_slot.lock() = Some(notify_throttling);
                Ok(())
            }),
            unregister_thermal_changed_callback: Arc::new(move || {
                *unregister_slot.lock() = None;
            }),
        };

        session.set_session_callback(
            SessionCallback {
                process_capture_result: Arc::new(move |result| {
                    let _ = result_tx.send(Event::Result(result));
                }),
                notify: Arc::new(move |message| {
                    let _ = event_tx.send(Event::Notify(message));
                }),
                request_stream_buffers: Arc::new(|_, _| None),
                return_stream_buffers: Arc::new(|_| {}),
            },
            Some(thermal_callback),
        );

        Self {
            session,
            events,
            throttle,
        }
    }

    fn inject_thermal(&self, severity: ThermalSeverity) {
        let notify_throttling = self.throttle.lock().clone().expect("rappel thermique");
        notify_throttling(severity);
    }

    fn recv_event(&self) -> Event {
        self.events
            .recv_timeout(Duration::from_secs(3))
            .expect("événement attendu")
    }

    /// Draine les événements jusqu'à ce que chaque trame donnée ait rapporté
    /// tous ses buffers attendus, et renvoie le journal complet
    fn drain_until_buffers(&self, expected: &HashMap<u32, usize>) -> Vec<Event> {
        let mut events = Vec::new();
        let mut remaining: HashMap<u32, usize> = expected.clone();
        while remaining.values().any(|count| *count > 0) {
            let event = self.recv_event();
            if let Event::Result(result) = &event {
                if let Some(count) = remaining.get_mut(&result.frame_number) {
                    *count = count.saturating_sub(result.output_buffers.len());
                }
            }
            events.push(event);
        }
        events
    }
}

fn bayer_characteristics(payload_frames: Option<i32>) -> Metadata {
    let mut characteristics = Metadata::new();
    characteristics.set_i32(
        tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE,
        &[0, 0, 4032, 3024],
    );
    characteristics.set_u8(
        tags::SENSOR_INFO_COLOR_FILTER_ARRANGEMENT,
        tags::COLOR_FILTER_ARRANGEMENT_RGGB,
    );
    if let Some(payload_frames) = payload_frames {
        characteristics.set_i32(vendor_tags::HDRPLUS_PAYLOAD_FRAMES, &[payload_frames]);
    }
    characteristics
}

fn mono_characteristics() -> Metadata {
    let mut characteristics = Metadata::new();
    characteristics.set_i32(
        tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE,
        &[0, 0, 1008, 756],
    );
    characteristics.set_u8(
        tags::SENSOR_INFO_COLOR_FILTER_ARRANGEMENT,
        tags::COLOR_FILTER_ARRANGEMENT_MONO,
    );
    characteristics
}

fn yuv_stream(id: i32, width: u32, height: u32) -> Stream {
    Stream {
        id,
        width,
        height,
        format: PixelFormat::Ycbcr420_888,
        ..Default::default()
    }
}

fn preview_stream(id: i32, width: u32, height: u32) -> Stream {
    Stream {
        usage: usage::HW_TEXTURE,
        ..yuv_stream(id, width, height)
    }
}

fn jpeg_stream(id: i32) -> Stream {
    Stream {
        id,
        width: 4032,
        height: 3024,
        format: PixelFormat::Blob,
        data_space: DataSpace::Jfif,
        ..Default::default()
    }
}

fn depth_stream(id: i32) -> Stream {
    Stream {
        id,
        width: 640,
        height: 480,
        format: PixelFormat::Y16,
        data_space: DataSpace::Depth,
        ..Default::default()
    }
}

fn framework_buffer(stream_id: i32, buffer_id: u64) -> StreamBuffer {
    StreamBuffer {
        stream_id,
        buffer_id,
        buffer: Some(BufferHandle::new(buffer_id)),
        ..Default::default()
    }
}

fn preview_settings() -> Metadata {
    let mut settings = Metadata::new();
    settings.set_u8(tags::CONTROL_CAPTURE_INTENT, tags::CAPTURE_INTENT_PREVIEW);
    settings
}

/// Scénario 1: passage direct sur un pipeline unique. Cinq requêtes, des
/// réglages sur la première seulement; cinq obturations en ordre puis un
/// buffer correct par trame.
#[test]
fn test_single_pipeline_passthrough() {
    let hwl = SimulatedHwlSession::single(0, bayer_characteristics(None));
    let harness = Harness::new(hwl, false);

    let config = StreamConfiguration {
        streams: vec![yuv_stream(0, 640, 480)],
        ..Default::default()
    };
    let hal_streams = harness.session.configure_streams(&config).unwrap();
    assert_eq!(hal_streams.len(), 1);

    let mut buffer_id = 1;
    for frame_number in 100..105 {
        let request = CaptureRequest {
            frame_number,
            settings: (frame_number == 100).then(preview_settings),
            output_buffers: vec![framework_buffer(0, buffer_id)],
            ..Default::default()
        };
        buffer_id += 1;
        assert_eq!(
            harness.session.process_capture_request(&[request]).unwrap(),
            1
        );
    }

    let expected: HashMap<u32, usize> = (100..105).map(|frame| (frame, 1)).collect();
    let events = harness.drain_until_buffers(&expected);

    // Les obturations sortent en ordre et chacune précède tout résultat de
    // sa trame
    let mut shutter_frames = Vec::new();
    let mut first_result_positions: HashMap<u32, usize> = HashMap::new();
    let mut shutter_positions: HashMap<u32, usize> = HashMap::new();
    for (position, event) in events.iter().enumerate() {
        match event {
            Event::Notify(NotifyMessage::Shutter(shutter)) => {
                shutter_positions.insert(shutter.frame_number, position);
                shutter_frames.push(shutter.frame_number);
            }
            Event::Result(result) => {
                first_result_positions
                    .entry(result.frame_number)
                    .or_insert(position);
            }
            Event::Notify(NotifyMessage::Error(error)) => {
                panic!("erreur inattendue: {:?}", error)
            }
        }
    }
    assert_eq!(shutter_frames, vec![100, 101, 102, 103, 104]);
    for frame_number in 100..105 {
        assert!(shutter_positions[&frame_number] < first_result_positions[&frame_number]);
    }

    // Chaque trame a rapporté son buffer YUV correct et sa métadonnée
    let mut ok_buffers = 0;
    let mut metadata_count = 0;
    for event in &events {
        if let Event::Result(result) = event {
            for buffer in &result.output_buffers {
                assert_eq!(buffer.stream_id, 0);
                assert_eq!(buffer.status, BufferStatus::Ok);
                ok_buffers += 1;
            }
            if result.result_metadata.is_some() {
                metadata_count += 1;
            }
        }
    }
    assert_eq!(ok_buffers, 5);
    assert_eq!(metadata_count, 5);
}

fn hdrplus_config() -> StreamConfiguration {
    StreamConfiguration {
        streams: vec![preview_stream(0, 1280, 720), jpeg_stream(1)],
        ..Default::default()
    }
}

fn still_request(frame_number: u32, buffer_id: u64) -> CaptureRequest {
    CaptureRequest {
        frame_number,
        settings: Some(hal_utils::make_hdrplus_still_settings(&Metadata::new())),
        output_buffers: vec![
            framework_buffer(0, buffer_id),
            framework_buffer(1, buffer_id + 1),
        ],
        ..Default::default()
    }
}

/// Scénario 2: rafale HDR+ et repli. Après dix prévisualisations, un cliché
/// passe par la chaîne de rafale; sur un anneau vide, le même cliché passe
/// par la chaîne temps réel et livre quand même son JPEG.
#[test]
fn test_hdrplus_burst_and_fallback() {
    let hwl = SimulatedHwlSession::single(0, bayer_characteristics(Some(3)));
    let harness = Harness::new(hwl.clone(), false);

    let hal_streams = harness.session.configure_streams(&hdrplus_config()).unwrap();
    // Aucun flux supplémentaire visible du framework
    assert_eq!(hal_streams.len(), 2);

    // Dix prévisualisations remplissent l'anneau RAW
    let mut buffer_id = 1;
    for frame_number in 1..11 {
        let request = CaptureRequest {
            frame_number,
            settings: Some(preview_settings()),
            output_buffers: vec![framework_buffer(0, buffer_id)],
            ..Default::default()
        };
        buffer_id += 1;
        harness.session.process_capture_request(&[request]).unwrap();
    }
    let expected: HashMap<u32, usize> = (1..11).map(|frame| (frame, 1)).collect();
    harness.drain_until_buffers(&expected);

    // Cliché HDR+: la chaîne de rafale (pipeline 1) reçoit la requête
    harness
        .session
        .process_capture_request(&[still_request(11, 100)])
        .unwrap();
    let expected: HashMap<u32, usize> = [(11u32, 2usize)].into_iter().collect();
    let events = harness.drain_until_buffers(&expected);

    assert_eq!(hwl.pipeline_submission_count(1), 1);
    let mut got_jpeg = false;
    let mut got_metadata = false;
    for event in &events {
        if let Event::Result(result) = event {
            assert_eq!(result.frame_number, 11);
            // Les RAW internes empruntés ne sortent jamais
            assert!(result.input_buffers.is_empty());
            for buffer in &result.output_buffers {
                assert_eq!(buffer.status, BufferStatus::Ok);
                if buffer.stream_id == 1 {
                    got_jpeg = true;
                }
            }
            if result.result_metadata.is_some() {
                got_metadata = true;
            }
        }
    }
    assert!(got_jpeg && got_metadata);

    // Anneau vide: le cliché se replie sur la chaîne temps réel
    let hwl = SimulatedHwlSession::single(0, bayer_characteristics(Some(3)));
    let harness = Harness::new(hwl.clone(), false);
    harness.session.configure_streams(&hdrplus_config()).unwrap();

    harness
        .session
        .process_capture_request(&[still_request(1, 1)])
        .unwrap();
    let expected: HashMap<u32, usize> = [(1u32, 2usize)].into_iter().collect();
    let events = harness.drain_until_buffers(&expected);

    // La rafale n'a rien reçu, et le JPEG est tout de même livré
    assert_eq!(hwl.pipeline_submission_count(1), 0);
    assert!(events.iter().any(|event| matches!(
        event,
        Event::Result(result) if result.output_buffers.iter().any(|buffer| {
            buffer.stream_id == 1 && buffer.status == BufferStatus::Ok
        })
    )));
}

/// Scénario 3: l'étranglement thermique désactive HDR+. La requête suivant
/// l'injection porte le tag; les clichés passent par la chaîne temps réel
/// et l'anneau n'est jamais alimenté.
#[test]
fn test_thermal_disables_hdrplus() {
    let hwl = SimulatedHwlSession::single(0, bayer_characteristics(Some(3)));
    let harness = Harness::new(hwl.clone(), false);
    harness.session.configure_streams(&hdrplus_config()).unwrap();

    harness.inject_thermal(ThermalSeverity::Severe);

    // La requête suivante porte l'étiquette; le simulateur renvoie les
    // réglages en métadonnées
    harness
        .session
        .process_capture_request(&[CaptureRequest {
            frame_number: 1,
            settings: Some(preview_settings()),
            output_buffers: vec![framework_buffer(0, 1)],
            ..Default::default()
        }])
        .unwrap();
    let expected: HashMap<u32, usize> = [(1u32, 1usize)].into_iter().collect();
    let events = harness.drain_until_buffers(&expected);
    let throttled = events.iter().any(|event| matches!(
        event,
        Event::Result(result) if result
            .result_metadata
            .as_ref()
            .and_then(|metadata| metadata.get_u8(vendor_tags::THERMAL_THROTTLING))
            == Some(1)
    ));
    assert!(throttled, "le tag d'étranglement thermique doit être posé");

    // D'autres prévisualisations, puis un cliché: tout reste temps réel
    let mut buffer_id = 10;
    for frame_number in 2..8 {
        harness
            .session
            .process_capture_request(&[CaptureRequest {
                frame_number,
                settings: Some(preview_settings()),
                output_buffers: vec![framework_buffer(0, buffer_id)],
                ..Default::default()
            }])
            .unwrap();
        buffer_id += 1;
    }
    let expected: HashMap<u32, usize> = (2..8).map(|frame| (frame, 1)).collect();
    harness.drain_until_buffers(&expected);

    harness
        .session
        .process_capture_request(&[still_request(8, 100)])
        .unwrap();
    let expected: HashMap<u32, usize> = [(8u32, 2usize)].into_iter().collect();
    harness.drain_until_buffers(&expected);

    // La chaîne de rafale n'a jamais été sollicitée
    assert_eq!(hwl.pipeline_submission_count(1), 0);
}

/// Scénario 4: profondeur à trois capteurs. Une requête de prévisualisation
/// puis une requête avec profondeur: trois pipelines sollicités, la
/// profondeur livrée, les buffers internes recyclés.
#[test]
fn test_three_sensor_depth() {
    let hwl = SimulatedHwlSession::logical(
        0,
        bayer_characteristics(None),
        vec![
            (1, bayer_characteristics(None)),
            (2, mono_characteristics()),
            (3, mono_characteristics()),
        ],
    );
    let harness = Harness::new(hwl.clone(), true);

    let config = StreamConfiguration {
        streams: vec![preview_stream(0, 1280, 720), depth_stream(1)],
        ..Default::default()
    };
    let hal_streams = harness.session.configure_streams(&config).unwrap();
    assert_eq!(hal_streams.len(), 2);
    assert_eq!(hwl.configured_pipeline_count(), 3);

    // Prévisualisation seule: une seule caméra travaille
    harness
        .session
        .process_capture_request(&[CaptureRequest {
            frame_number: 1,
            settings: Some(preview_settings()),
            output_buffers: vec![framework_buffer(0, 1)],
            ..Default::default()
        }])
        .unwrap();
    let expected: HashMap<u32, usize> = [(1u32, 1usize)].into_iter().collect();
    harness.drain_until_buffers(&expected);

    // Requête avec profondeur: éclatement sur les trois pipelines
    harness
        .session
        .process_capture_request(&[CaptureRequest {
            frame_number: 2,
            settings: Some(preview_settings()),
            output_buffers: vec![framework_buffer(0, 2), framework_buffer(1, 3)],
            ..Default::default()
        }])
        .unwrap();
    let expected: HashMap<u32, usize> = [(2u32, 2usize)].into_iter().collect();
    let events = harness.drain_until_buffers(&expected);

    for pipeline_id in 0..3 {
        assert!(
            hwl.pipeline_submission_count(pipeline_id) >= 1,
            "le pipeline {} n'a pas été sollicité",
            pipeline_id
        );
    }

    let mut got_preview = false;
    let mut got_depth = false;
    let mut metadata_count = 0;
    let mut shutter_count = 0;
    for event in &events {
        match event {
            Event::Result(result) => {
                assert_eq!(result.frame_number, 2);
                // Les buffers internes ne sortent jamais vers le framework
                assert!(result.input_buffers.is_empty());
                for buffer in &result.output_buffers {
                    assert_eq!(buffer.status, BufferStatus::Ok);
                    match buffer.stream_id {
                        0 => got_preview = true,
                        1 => got_depth = true,
                        other => panic!("flux inattendu dans un résultat: {}", other),
                    }
                }
                if result.result_metadata.is_some() {
                    metadata_count += 1;
                }
            }
            Event::Notify(NotifyMessage::Shutter(shutter)) => {
                if shutter.frame_number == 2 {
                    shutter_count += 1;
                }
            }
            Event::Notify(NotifyMessage::Error(error)) => {
                panic!("erreur inattendue: {:?}", error)
            }
        }
    }
    assert!(got_preview && got_depth);
    assert_eq!(metadata_count, 1);
    // Une seule obturation: celle de la caméra meneuse
    assert_eq!(shutter_count, 1);
}

/// Scénario 5: agrégation physique double infrarouge. Deux sous-requêtes,
/// deux métadonnées physiques agrégées en un résultat logique, obturation
/// de la seule caméra meneuse.
#[test]
fn test_dual_ir_physical_aggregation() {
    let mut logical_characteristics = mono_characteristics();
    logical_characteristics.set_i32(vendor_tags::DEFAULT_PHYSICAL_CAM_ID, &[2]);
    let hwl = SimulatedHwlSession::logical(
        0,
        logical_characteristics,
        vec![(2, mono_characteristics()), (3, mono_characteristics())],
    );
    let harness = Harness::new(hwl.clone(), false);

    let config = StreamConfiguration {
        streams: vec![
            Stream {
                id: 0,
                width: 640,
                height: 480,
                format: PixelFormat::Y8,
                is_physical_camera_stream: true,
                physical_camera_id: 2,
                ..Default::default()
            },
            Stream {
                id: 1,
                width: 640,
                height: 480,
                format: PixelFormat::Y8,
                is_physical_camera_stream: true,
                physical_camera_id: 3,
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    harness.session.configure_streams(&config).unwrap();
    assert_eq!(hwl.configured_pipeline_count(), 2);

    harness
        .session
        .process_capture_request(&[CaptureRequest {
            frame_number: 1,
            settings: Some(preview_settings()),
            output_buffers: vec![framework_buffer(0, 1), framework_buffer(1, 2)],
            ..Default::default()
        }])
        .unwrap();
    let expected: HashMap<u32, usize> = [(1u32, 2usize)].into_iter().collect();
    let events = harness.drain_until_buffers(&expected);

    // Deux sous-requêtes, une par pipeline
    assert_eq!(hwl.pipeline_submission_count(0), 1);
    assert_eq!(hwl.pipeline_submission_count(1), 1);

    let mut shutter_count = 0;
    let mut aggregated = false;
    for event in &events {
        match event {
            Event::Notify(NotifyMessage::Shutter(_)) => shutter_count += 1,
            Event::Result(result) => {
                if let Some(metadata) = &result.result_metadata {
                    // Le résultat logique agrège les deux métadonnées
                    // physiques et porte la caméra meneuse active
                    assert_eq!(result.physical_metadata.len(), 2);
                    assert!(result.physical_metadata.contains_key(&2));
                    assert!(result.physical_metadata.contains_key(&3));
                    assert!(metadata
                        .get(tags::LOGICAL_MULTI_CAMERA_ACTIVE_PHYSICAL_ID)
                        .is_some());
                    aggregated = true;
                }
            }
            Event::Notify(NotifyMessage::Error(error)) => {
                panic!("erreur inattendue: {:?}", error)
            }
        }
    }
    assert_eq!(shutter_count, 1);
    assert!(aggregated);
}

/// Scénario 6: vidage avec requêtes en vol. Quatre requêtes soumises puis
/// un vidage: chaque trame se termine, complète ou en erreur de requête.
#[test]
fn test_flush_with_in_flight_requests() {
    let hwl = SimulatedHwlSession::single(0, bayer_characteristics(None));
    hwl.set_options(argos_hwl::SimulatorOptions {
        result_delay: Duration::from_millis(30),
        ..Default::default()
    });
    let harness = Harness::new(hwl, false);

    let config = StreamConfiguration {
        streams: vec![yuv_stream(0, 640, 480)],
        ..Default::default()
    };
    harness.session.configure_streams(&config).unwrap();

    for frame_number in 1..5 {
        harness
            .session
            .process_capture_request(&[CaptureRequest {
                frame_number,
                settings: (frame_number == 1).then(preview_settings),
                output_buffers: vec![framework_buffer(0, frame_number as u64)],
                ..Default::default()
            }])
            .unwrap();
    }

    harness.session.flush().unwrap();

    // Toutes les trames se terminent: un buffer (correct ou en erreur) ou
    // une erreur de requête pour chacune des quatre
    let mut terminated: HashMap<u32, bool> = (1..5).map(|frame| (frame, false)).collect();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while terminated.values().any(|done| !done) {
        assert!(
            std::time::Instant::now() < deadline,
            "des trames n'ont pas terminé: {:?}",
            terminated
        );
        match harness.events.recv_timeout(Duration::from_secs(2)) {
            Ok(Event::Result(result)) => {
                if !result.output_buffers.is_empty() {
                    terminated.insert(result.frame_number, true);
                }
            }
            Ok(Event::Notify(NotifyMessage::Error(error))) => {
                if error.error_code == ErrorCode::Request {
                    terminated.insert(error.frame_number, true);
                }
            }
            Ok(_) => {}
            Err(e) => panic!("attente de terminaison interrompue: {}", e),
        }
    }
}

/// Invariant: le vidage est idempotent
#[test]
fn test_flush_idempotent() {
    let hwl = SimulatedHwlSession::single(0, bayer_characteristics(None));
    let harness = Harness::new(hwl, false);

    let config = StreamConfiguration {
        streams: vec![yuv_stream(0, 640, 480)],
        ..Default::default()
    };
    harness.session.configure_streams(&config).unwrap();

    harness.session.flush().unwrap();
    harness.session.flush().unwrap();
}
