use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use argos_core::metadata::{tags, vendor_tags};
use argos_core::stream::usage;
use argos_core::{
    BufferStatus, ErrorCode, ErrorMessage, HalStream, Metadata, NotifyMessage, PixelFormat,
    RequestTemplate, ShutterMessage, StreamConfiguration,
};

use crate::{
    DeviceSessionHwl, HwlError, HwlPipelineCallback, HwlPipelineRequest, HwlPipelineResult,
    HwlSessionCallback, ZoomRatioMapper,
};

/// Options du HWL simulé
#[derive(Debug, Clone)]
pub struct SimulatorOptions {
    /// Nombre maximal de buffers en vol par flux HAL
    pub default_max_buffers: u32,

    /// Pas de l'horloge d'obturation entre deux trames, en nanosecondes
    pub frame_interval_ns: u64,

    /// Délai artificiel avant l'émission d'un résultat
    pub result_delay: Duration,

    /// Vrai si le dispositif annonce la gestion de buffers par le HAL
    pub buffer_management_supported: bool,
}

impl Default for SimulatorOptions {
    fn default() -> Self {
        Self {
            default_max_buffers: 4,
            frame_interval_ns: 33_000_000,
            result_delay: Duration::from_millis(0),
            buffer_management_supported: false,
        }
    }
}

struct WorkItem {
    frame_number: u32,
    request: HwlPipelineRequest,
}

struct PipelineState {
    camera_id: u32,
    callback: HwlPipelineCallback,
    hal_streams: Vec<HalStream>,
    sender: Option<Sender<WorkItem>>,
}

struct Inner {
    next_pipeline_id: AtomicU32,
    pipelines: Mutex<HashMap<u32, PipelineState>>,
    built: AtomicBool,
    clock_ns: AtomicU64,
    options: Mutex<SimulatorOptions>,
    fail_submit: AtomicBool,
    error_stream: Mutex<Option<i32>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    session_callback: Mutex<Option<HwlSessionCallback>>,
    submitted_requests: AtomicU64,
    pipeline_submissions: Mutex<HashMap<u32, u64>>,
}

/// Session HWL simulée: un thread de travail par pipeline configuré, une
/// horloge d'obturation monotone partagée, et de l'injection de fautes pour
/// les tests.
pub struct SimulatedHwlSession {
    camera_id: u32,
    physical_ids: Vec<u32>,
    characteristics: Metadata,
    physical_characteristics: BTreeMap<u32, Metadata>,
    inner: Arc<Inner>,
}

impl SimulatedHwlSession {
    /// Session pour un dispositif à capteur unique
    pub fn single(camera_id: u32, characteristics: Metadata) -> Arc<Self> {
        Self::create(camera_id, characteristics, Vec::new())
    }

    /// Session pour un dispositif logique agrégeant des caméras physiques
    pub fn logical(
        camera_id: u32,
        characteristics: Metadata,
        physical: Vec<(u32, Metadata)>,
    ) -> Arc<Self> {
        Self::create(camera_id, characteristics, physical)
    }

    fn create(
        camera_id: u32,
        characteristics: Metadata,
        physical: Vec<(u32, Metadata)>,
    ) -> Arc<Self> {
        info!(
            "Création d'une session HWL simulée: caméra {} ({} caméras physiques)",
            camera_id,
            physical.len()
        );

        let physical_ids = physical.iter().map(|(id, _)| *id).collect();
        let physical_characteristics = physical.into_iter().collect();

        Arc::new(Self {
            camera_id,
            physical_ids,
            characteristics,
            physical_characteristics,
            inner: Arc::new(Inner {
                next_pipeline_id: AtomicU32::new(0),
                pipelines: Mutex::new(HashMap::new()),
                built: AtomicBool::new(false),
                clock_ns: AtomicU64::new(0),
                options: Mutex::new(SimulatorOptions::default()),
                fail_submit: AtomicBool::new(false),
                error_stream: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                session_callback: Mutex::new(None),
                submitted_requests: AtomicU64::new(0),
                pipeline_submissions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Remplace les options du simulateur. À faire avant `build_pipelines`.
    pub fn set_options(&self, options: SimulatorOptions) {
        *self.inner.options.lock() = options;
    }

    /// Force l'échec des soumissions suivantes
    pub fn set_fail_submit(&self, fail: bool) {
        self.inner.fail_submit.store(fail, Ordering::SeqCst);
    }

    /// Les buffers du flux donné reviendront en erreur, avec la
    /// notification correspondante
    pub fn set_error_stream(&self, stream_id: Option<i32>) {
        *self.inner.error_stream.lock() = stream_id;
    }

    /// Nombre de requêtes de pipeline soumises depuis la création
    pub fn submitted_request_count(&self) -> u64 {
        self.inner.submitted_requests.load(Ordering::SeqCst)
    }

    /// Nombre de requêtes soumises à un pipeline donné
    pub fn pipeline_submission_count(&self, pipeline_id: u32) -> u64 {
        self.inner
            .pipeline_submissions
            .lock()
            .get(&pipeline_id)
            .copied()
            .unwrap_or(0)
    }

    /// Nombre de pipelines actuellement configurés
    pub fn configured_pipeline_count(&self) -> usize {
        self.inner.pipelines.lock().len()
    }

    fn make_hal_streams(config: &StreamConfiguration, max_buffers: u32) -> Vec<HalStream> {
        config
            .streams
            .iter()
            .map(|stream| HalStream {
                id: stream.id,
                override_format: match stream.format {
                    PixelFormat::ImplementationDefined => PixelFormat::Ycbcr420_888,
                    format => format,
                },
                producer_usage: usage::CAMERA_WRITE,
                consumer_usage: stream.usage,
                max_buffers,
                override_data_space: stream.data_space,
                is_physical_camera_stream: stream.is_physical_camera_stream,
                physical_camera_id: stream.physical_camera_id,
            })
            .collect()
    }

    fn run_worker(
        inner: Arc<Inner>,
        pipeline_id: u32,
        camera_id: u32,
        callback: HwlPipelineCallback,
        receiver: channel::Receiver<WorkItem>,
    ) {
        while let Ok(item) = receiver.recv() {
            let (interval, delay) = {
                let options = inner.options.lock();
                (options.frame_interval_ns, options.result_delay)
            };
            let timestamp_ns = inner.clock_ns.fetch_add(interval, Ordering::SeqCst) + interval;

            (callback.notify)(
                pipeline_id,
                NotifyMessage::Shutter(ShutterMessage {
                    frame_number: item.frame_number,
                    timestamp_ns,
                }),
            );

            if !delay.is_zero() {
                thread::sleep(delay);
            }

            let error_stream = *inner.error_stream.lock();
            let mut output_buffers = item.request.output_buffers.clone();
            for buffer in &mut output_buffers {
                if error_stream == Some(buffer.stream_id) {
                    buffer.status = BufferStatus::Error;
                    (callback.notify)(
                        pipeline_id,
                        NotifyMessage::Error(ErrorMessage {
                            frame_number: item.frame_number,
                            error_stream_id: Some(buffer.stream_id),
                            error_code: ErrorCode::Buffer,
                        }),
                    );
                } else {
                    buffer.status = BufferStatus::Ok;
                }
            }

            let mut result_metadata = item.request.settings.clone().unwrap_or_default();
            result_metadata.set_i64(tags::SENSOR_TIMESTAMP, timestamp_ns as i64);

            (callback.process_pipeline_result)(HwlPipelineResult {
                camera_id,
                pipeline_id,
                frame_number: item.frame_number,
                partial_result: 1,
                result_metadata: Some(result_metadata),
                input_buffers: item.request.input_buffers,
                output_buffers,
                physical_metadata: BTreeMap::new(),
            });
        }

        debug!("Arrêt du thread du pipeline simulé {}", pipeline_id);
    }
}

impl DeviceSessionHwl for SimulatedHwlSession {
    fn get_camera_id(&self) -> u32 {
        self.camera_id
    }

    fn get_physical_camera_ids(&self) -> Vec<u32> {
        self.physical_ids.clone()
    }

    fn get_camera_characteristics(&self) -> Result<Metadata, HwlError> {
        Ok(self.characteristics.clone())
    }

    fn get_physical_camera_characteristics(
        &self,
        physical_camera_id: u32,
    ) -> Result<Metadata, HwlError> {
        self.physical_characteristics
            .get(&physical_camera_id)
            .cloned()
            .ok_or_else(|| {
                HwlError::BadValue(format!("Caméra physique inconnue: {}", physical_camera_id))
            })
    }

    fn configure_pipeline(
        &self,
        camera_id: u32,
        callback: HwlPipelineCallback,
        pipeline_config: &StreamConfiguration,
        _overall_config: &StreamConfiguration,
    ) -> Result<u32, HwlError> {
        if self.inner.built.load(Ordering::SeqCst) {
            return Err(HwlError::AlreadyExists(
                "Pipelines déjà construits".to_string(),
            ));
        }

        if pipeline_config.streams.is_empty() {
            return Err(HwlError::BadValue(
                "Configuration de pipeline sans flux".to_string(),
            ));
        }

        let pipeline_id = self.inner.next_pipeline_id.fetch_add(1, Ordering::SeqCst);
        let max_buffers = self.inner.options.lock().default_max_buffers;
        let hal_streams = Self::make_hal_streams(pipeline_config, max_buffers);

        self.inner.pipelines.lock().insert(
            pipeline_id,
            PipelineState {
                camera_id,
                callback,
                hal_streams,
                sender: None,
            },
        );

        debug!(
            "Pipeline simulé {} configuré pour la caméra {} ({} flux)",
            pipeline_id,
            camera_id,
            pipeline_config.streams.len()
        );

        Ok(pipeline_id)
    }

    fn build_pipelines(&self) -> Result<(), HwlError> {
        if self.inner.built.swap(true, Ordering::SeqCst) {
            return Err(HwlError::AlreadyExists(
                "Pipelines déjà construits".to_string(),
            ));
        }

        let mut pipelines = self.inner.pipelines.lock();
        if pipelines.is_empty() {
            self.inner.built.store(false, Ordering::SeqCst);
            return Err(HwlError::NoInit("Aucun pipeline configuré".to_string()));
        }

        let mut workers = self.inner.workers.lock();
        for (pipeline_id, state) in pipelines.iter_mut() {
            let (sender, receiver) = channel::bounded::<WorkItem>(32);
            state.sender = Some(sender);

            let inner = self.inner.clone();
            let callback = state.callback.clone();
            let camera_id = state.camera_id;
            let pipeline_id = *pipeline_id;
            workers.push(thread::spawn(move || {
                Self::run_worker(inner, pipeline_id, camera_id, callback, receiver);
            }));
        }

        info!("{} pipelines simulés construits", pipelines.len());
        Ok(())
    }

    fn destroy_pipelines(&self) {
        {
            let mut pipelines = self.inner.pipelines.lock();
            for state in pipelines.values_mut() {
                state.sender = None;
            }
            pipelines.clear();
        }

        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }

        self.inner.built.store(false, Ordering::SeqCst);
        self.inner.next_pipeline_id.store(0, Ordering::SeqCst);
    }

    fn get_configured_hal_streams(&self, pipeline_id: u32) -> Result<Vec<HalStream>, HwlError> {
        self.inner
            .pipelines
            .lock()
            .get(&pipeline_id)
            .map(|state| state.hal_streams.clone())
            .ok_or_else(|| HwlError::BadValue(format!("Pipeline inconnu: {}", pipeline_id)))
    }

    fn submit_requests(
        &self,
        frame_number: u32,
        requests: Vec<HwlPipelineRequest>,
    ) -> Result<(), HwlError> {
        if !self.inner.built.load(Ordering::SeqCst) {
            return Err(HwlError::NoInit("Pipelines non construits".to_string()));
        }

        if self.inner.fail_submit.load(Ordering::SeqCst) {
            return Err(HwlError::Unavailable(
                "Soumission refusée (injection de faute)".to_string(),
            ));
        }

        let pipelines = self.inner.pipelines.lock();
        // Valider l'ensemble avant de déposer quoi que ce soit
        for request in &requests {
            if !pipelines.contains_key(&request.pipeline_id) {
                return Err(HwlError::BadValue(format!(
                    "Pipeline inconnu: {}",
                    request.pipeline_id
                )));
            }
        }

        for request in requests {
            let state = pipelines.get(&request.pipeline_id).unwrap();
            let sender = state.sender.as_ref().ok_or_else(|| {
                HwlError::NoInit(format!("Pipeline {} non démarré", request.pipeline_id))
            })?;
            let pipeline_id = request.pipeline_id;
            sender
                .send(WorkItem {
                    frame_number,
                    request,
                })
                .map_err(|_| HwlError::Unavailable("Pipeline arrêté".to_string()))?;
            self.inner.submitted_requests.fetch_add(1, Ordering::SeqCst);
            *self
                .inner
                .pipeline_submissions
                .lock()
                .entry(pipeline_id)
                .or_insert(0) += 1;
        }

        Ok(())
    }

    fn flush(&self) -> Result<(), HwlError> {
        // Les requêtes en vol se terminent normalement
        Ok(())
    }

    fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> Result<Metadata, HwlError> {
        let mut settings = Metadata::new();
        let intent = match template {
            RequestTemplate::Preview => tags::CAPTURE_INTENT_PREVIEW,
            RequestTemplate::StillCapture => tags::CAPTURE_INTENT_STILL_CAPTURE,
            RequestTemplate::VideoRecord => tags::CAPTURE_INTENT_VIDEO_RECORD,
            RequestTemplate::VideoSnapshot => tags::CAPTURE_INTENT_VIDEO_SNAPSHOT,
            RequestTemplate::ZeroShutterLag => tags::CAPTURE_INTENT_ZERO_SHUTTER_LAG,
            RequestTemplate::Manual => tags::CAPTURE_INTENT_CUSTOM,
        };
        settings.set_u8(tags::CONTROL_CAPTURE_INTENT, intent);
        settings.set_u8(tags::CONTROL_MODE, tags::CONTROL_MODE_AUTO);
        settings.set_u8(tags::CONTROL_AE_MODE, tags::AE_MODE_ON);
        settings.set_u8(tags::CONTROL_AWB_MODE, tags::AWB_MODE_AUTO);
        settings.set_u8(tags::FLASH_MODE, tags::FLASH_MODE_OFF);
        settings.set_u8(tags::NOISE_REDUCTION_MODE, tags::MODE_FAST);
        settings.set_u8(tags::EDGE_MODE, tags::MODE_FAST);
        Ok(settings)
    }

    fn filter_result_metadata(&self, metadata: &mut Metadata) {
        // Les entrées privées du HWL simulé se résument au tag hybrid AE
        if metadata.erase(vendor_tags::HYBRID_AE_ENABLED) {
            debug!("Métadonnée privée hybrid AE filtrée du résultat");
        }
    }

    fn prepare_pipeline(&self, pipeline_id: u32, _frame_number: u32) -> Result<(), HwlError> {
        if !self.inner.pipelines.lock().contains_key(&pipeline_id) {
            return Err(HwlError::BadValue(format!(
                "Pipeline inconnu: {}",
                pipeline_id
            )));
        }
        Ok(())
    }

    fn is_reconfiguration_required(
        &self,
        old_session_params: Option<&Metadata>,
        new_session_params: Option<&Metadata>,
    ) -> Result<bool, HwlError> {
        let old_fov = old_session_params.and_then(|m| m.get_u8(vendor_tags::SENSOR_MODE_FULL_FOV));
        let new_fov = new_session_params.and_then(|m| m.get_u8(vendor_tags::SENSOR_MODE_FULL_FOV));
        Ok(old_fov != new_fov)
    }

    fn set_session_callback(&self, session_callback: HwlSessionCallback) {
        *self.inner.session_callback.lock() = Some(session_callback);
    }

    fn get_zoom_ratio_mapper(&self) -> Option<ZoomRatioMapper> {
        let active = self
            .characteristics
            .get_i32_slice(tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE)?;
        if active.len() != 4 {
            warn!("Matrice active mal formée dans les caractéristiques");
            return None;
        }
        Some(ZoomRatioMapper::new(active[2] as u32, active[3] as u32))
    }

    fn is_session_buffer_management_supported(&self) -> bool {
        self.inner.options.lock().buffer_management_supported
    }
}

impl Drop for SimulatedHwlSession {
    fn drop(&mut self) {
        self.destroy_pipelines();
    }
}
