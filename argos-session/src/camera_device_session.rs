use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use argos_core::metadata::{tags, vendor_tags};
use argos_core::stream::usage;
use argos_core::{
    BufferHandle, BufferStatus, CaptureRequest, CaptureResult, ErrorCode, ErrorMessage, HalStream,
    Metadata, NotifyMessage, OutputIntent, RequestTemplate, Stream, StreamConfiguration,
};
use argos_hwl::{
    BufferInterop, DepthGeneratorFactory, DeviceSessionHwl, HwlSessionCallback,
    InternalBufferAllocator, NotifyThrottlingFn, ThermalCallback, ThermalSeverity,
    ZoomRatioMapper,
};

use crate::capture_session::{
    create_capture_session, CaptureSession, CaptureSessionParams, SessionOptions,
};
use crate::hal_utils;
use crate::pending_requests_tracker::PendingRequestsTracker;
use crate::stream_buffer_cache::StreamBufferCacheManager;
use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Rappels de session installés par le framework
#[derive(Clone)]
pub struct SessionCallback {
    pub process_capture_result: ProcessCaptureResultFn,
    pub notify: NotifyFn,
    pub request_stream_buffers: argos_hwl::HwlRequestBuffersFn,
    pub return_stream_buffers: argos_hwl::HwlReturnBuffersFn,
}

struct ConfigState {
    /// Flux configurés, par identifiant
    configured_streams: HashMap<i32, Stream>,

    /// Base de réglages "sticky": premiers réglages non nuls reçus
    sticky_settings: Option<Metadata>,
}

struct BufferCacheEntry {
    raw: BufferHandle,
    imported: BufferHandle,
}

struct BufferManagementState {
    tracker: Option<Arc<PendingRequestsTracker>>,
    cache_manager: Option<Arc<StreamBufferCacheManager>>,

    /// Couples (trame, flux) dont le buffer a été substitué par un
    /// factice: chaque livraison correspondante est réécrite en rapport
    /// d'erreur. Les livraisons arrivent buffer par buffer, la clé doit
    /// donc porter le flux et pas seulement la trame.
    error_frames: HashSet<(u32, i32)>,
}

/// Façade de session visible du framework pour un dispositif ouvert.
///
/// Possède le cache d'import des buffers, la comptabilité des requêtes en
/// attente, l'état thermique et la session de capture active. Ré-entrante
/// depuis deux directions: le framework soumet des requêtes pendant que les
/// threads du HWL remontent résultats et notifications.
pub struct CameraDeviceSession {
    device_session_hwl: Arc<dyn DeviceSessionHwl>,
    buffer_interop: Arc<dyn BufferInterop>,
    allocator: Arc<dyn InternalBufferAllocator>,
    depth_generator_factory: Option<DepthGeneratorFactory>,
    options: SessionOptions,

    zoom_mapper: Option<ZoomRatioMapper>,
    buffer_management_supported: bool,

    // Verrous séparés par responsabilité
    config: Mutex<ConfigState>,
    buffer_cache: Mutex<HashMap<(i32, u64), BufferCacheEntry>>,
    buffer_management: Mutex<BufferManagementState>,
    session_callback: RwLock<Option<SessionCallback>>,
    capture_session: RwLock<Option<Box<dyn CaptureSession>>>,
    thermal_callback: Mutex<Option<ThermalCallback>>,
    default_settings_cache: Mutex<HashMap<RequestTemplate, Metadata>>,

    thermal_throttling: AtomicBool,
    thermal_throttling_notified: AtomicBool,
    is_flushing: AtomicBool,
}

impl CameraDeviceSession {
    pub fn new(
        device_session_hwl: Arc<dyn DeviceSessionHwl>,
        buffer_interop: Arc<dyn BufferInterop>,
        allocator: Arc<dyn InternalBufferAllocator>,
        depth_generator_factory: Option<DepthGeneratorFactory>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let zoom_mapper = device_session_hwl.get_zoom_ratio_mapper();
        let buffer_management_supported =
            device_session_hwl.is_session_buffer_management_supported();

        info!(
            "Session de dispositif créée: caméra {} (gestion de buffers: {})",
            device_session_hwl.get_camera_id(),
            buffer_management_supported
        );

        Arc::new(Self {
            device_session_hwl,
            buffer_interop,
            allocator,
            depth_generator_factory,
            options,
            zoom_mapper,
            buffer_management_supported,
            config: Mutex::new(ConfigState {
                configured_streams: HashMap::new(),
                sticky_settings: None,
            }),
            buffer_cache: Mutex::new(HashMap::new()),
            buffer_management: Mutex::new(BufferManagementState {
                tracker: None,
                cache_manager: None,
                error_frames: HashSet::new(),
            }),
            session_callback: RwLock::new(None),
            capture_session: RwLock::new(None),
            thermal_callback: Mutex::new(None),
            default_settings_cache: Mutex::new(HashMap::new()),
            thermal_throttling: AtomicBool::new(false),
            thermal_throttling_notified: AtomicBool::new(false),
            is_flushing: AtomicBool::new(false),
        })
    }

    /// Installe les rappels du framework et la paire thermique. À appeler
    /// avant `configure_streams`.
    pub fn set_session_callback(
        self: &Arc<Self>,
        session_callback: SessionCallback,
        thermal_callback: Option<ThermalCallback>,
    ) {
        *self.session_callback.write() = Some(session_callback.clone());

        if let Some(thermal_callback) = thermal_callback {
            let weak_session: Weak<Self> = Arc::downgrade(self);
            let notify_throttling: NotifyThrottlingFn = Arc::new(move |severity| {
                if let Some(session) = weak_session.upgrade() {
                    session.notify_throttling(severity);
                }
            });
            if let Err(e) =
                (thermal_callback.register_thermal_changed_callback)(notify_throttling)
            {
                warn!("Enregistrement du rappel thermique échoué: {}", e);
            }
            *self.thermal_callback.lock() = Some(thermal_callback);
        }

        // Ré-entrée de buffers pour le HWL, comptabilisée quand le quota
        // d'acquisition est actif
        let weak_session: Weak<Self> = Arc::downgrade(self);
        let request_session = weak_session.clone();
        let request_callback = session_callback.request_stream_buffers.clone();
        let return_callback = session_callback.return_stream_buffers.clone();
        let return_session = weak_session;
        self.device_session_hwl.set_session_callback(HwlSessionCallback {
            request_stream_buffers: Arc::new(move |stream_id, count| {
                if let Some(session) = request_session.upgrade() {
                    let tracker = session.buffer_management.lock().tracker.clone();
                    if let Some(tracker) = tracker {
                        if tracker.wait_and_track_acquired_buffers(stream_id, count).is_err() {
                            return None;
                        }
                    }
                }
                request_callback(stream_id, count)
            }),
            return_stream_buffers: Arc::new(move |buffers| {
                if let Some(session) = return_session.upgrade() {
                    let tracker = session.buffer_management.lock().tracker.clone();
                    if let Some(tracker) = tracker {
                        tracker.track_returned_acquired_buffers(&buffers);
                    }
                }
                return_callback(buffers)
            }),
        });
    }

    fn notify_throttling(&self, severity: ThermalSeverity) {
        let throttling = severity >= ThermalSeverity::Severe;
        let previous = self.thermal_throttling.swap(throttling, Ordering::SeqCst);
        if previous != throttling {
            info!(
                "Étranglement thermique: {} (sévérité {:?})",
                throttling, severity
            );
            self.thermal_throttling_notified.store(false, Ordering::SeqCst);
        }
    }

    /// Configure les flux: sélectionne et câble la session de capture et
    /// renvoie les flux HAL visibles du framework
    pub fn configure_streams(
        self: &Arc<Self>,
        stream_config: &StreamConfiguration,
    ) -> Result<Vec<HalStream>, SessionError> {
        // Détruire l'ancienne chaîne et vider les caches
        *self.capture_session.write() = None;
        self.free_buffer_cache();
        {
            let mut config = self.config.lock();
            config.configured_streams.clear();
            config.sticky_settings = None;
        }
        self.is_flushing.store(false, Ordering::SeqCst);
        self.thermal_throttling_notified.store(false, Ordering::SeqCst);

        let weak_result: Weak<Self> = Arc::downgrade(self);
        let process_capture_result: ProcessCaptureResultFn = Arc::new(move |result| {
            if let Some(session) = weak_result.upgrade() {
                session.process_session_result(result);
            }
        });
        let weak_notify: Weak<Self> = Arc::downgrade(self);
        let notify: NotifyFn = Arc::new(move |message| {
            if let Some(session) = weak_notify.upgrade() {
                session.process_session_notify(message);
            }
        });

        let params = CaptureSessionParams {
            device_session: self.device_session_hwl.clone(),
            allocator: self.allocator.clone(),
            depth_generator_factory: self.depth_generator_factory.clone(),
            options: self.options.clone(),
        };
        let (capture_session, hal_streams) = create_capture_session(
            &[],
            &params,
            stream_config,
            process_capture_result,
            notify,
        )?;

        {
            let mut config = self.config.lock();
            for stream in &stream_config.streams {
                config.configured_streams.insert(stream.id, stream.clone());
            }
        }

        // Comptabilité des buffers, seulement quand le dispositif la
        // supporte
        if self.buffer_management_supported {
            let mut buffer_management = self.buffer_management.lock();
            buffer_management.tracker = Some(PendingRequestsTracker::new(&hal_streams));

            let session_callback = self.session_callback.read();
            if let Some(session_callback) = session_callback.as_ref() {
                let cache_manager = Arc::new(StreamBufferCacheManager::new(
                    session_callback.request_stream_buffers.clone(),
                ));
                for hal_stream in &hal_streams {
                    cache_manager.register_stream(hal_stream.id);
                }
                buffer_management.cache_manager = Some(cache_manager);
            }
            buffer_management.error_frames.clear();
        }

        *self.capture_session.write() = Some(capture_session);
        Ok(hal_streams)
    }

    /// Réglages par défaut pour un modèle, mis en cache par modèle. Pour un
    /// dispositif logique, la caméra physique par défaut est estampillée.
    pub fn construct_default_request_settings(
        &self,
        template: RequestTemplate,
    ) -> Result<Metadata, SessionError> {
        if let Some(settings) = self.default_settings_cache.lock().get(&template) {
            return Ok(settings.clone());
        }

        let mut settings = self
            .device_session_hwl
            .construct_default_request_settings(template)?;

        let physical_ids = self.device_session_hwl.get_physical_camera_ids();
        if let Some(first_physical) = physical_ids.first() {
            settings.set_i32(
                vendor_tags::DEFAULT_PHYSICAL_CAM_ID,
                &[*first_physical as i32],
            );
        }

        self.default_settings_cache
            .lock()
            .insert(template, settings.clone());
        Ok(settings)
    }

    /// Importe un buffer du framework, ou réutilise l'import en cache.
    /// Réimporter la même clé avec un handle brut différent est fatal.
    fn import_buffer(
        &self,
        stream_id: i32,
        buffer_id: u64,
        raw: BufferHandle,
    ) -> Result<BufferHandle, SessionError> {
        let mut buffer_cache = self.buffer_cache.lock();
        match buffer_cache.get(&(stream_id, buffer_id)) {
            Some(entry) if entry.raw == raw => Ok(entry.imported),
            Some(entry) => Err(SessionError::BadValue(format!(
                "Import incohérent du buffer ({}, {}): handle {} déjà vu comme {}",
                stream_id, buffer_id, raw.raw, entry.raw.raw
            ))),
            None => {
                let imported = self.buffer_interop.import_buffer(raw)?;
                buffer_cache.insert((stream_id, buffer_id), BufferCacheEntry { raw, imported });
                Ok(imported)
            }
        }
    }

    /// Libère des entrées du cache d'import
    pub fn remove_buffer_cache(&self, keys: &[(i32, u64)]) {
        let mut buffer_cache = self.buffer_cache.lock();
        for key in keys {
            match buffer_cache.remove(key) {
                Some(entry) => self.buffer_interop.free_buffer(entry.imported),
                None => warn!("Clé de cache inconnue: ({}, {})", key.0, key.1),
            }
        }
    }

    fn free_buffer_cache(&self) {
        let mut buffer_cache = self.buffer_cache.lock();
        for (_, entry) in buffer_cache.drain() {
            self.buffer_interop.free_buffer(entry.imported);
        }
    }

    /// Estampille l'intention de sortie d'après les buffers de la requête
    fn append_output_intent(&self, request: &CaptureRequest, settings: &mut Metadata) {
        let config = self.config.lock();

        let mut has_video = false;
        let mut has_snapshot = false;
        for buffer in &request.output_buffers {
            if let Some(stream) = config.configured_streams.get(&buffer.stream_id) {
                if hal_utils::is_video_stream(stream) {
                    has_video = true;
                } else if hal_utils::is_jpeg_snapshot_stream(stream) {
                    has_snapshot = true;
                }
            }
        }

        let mut has_zsl = false;
        for buffer in &request.input_buffers {
            if let Some(stream) = config.configured_streams.get(&buffer.stream_id) {
                if (stream.usage & usage::CAMERA_ZSL) != 0 {
                    has_zsl = true;
                    break;
                }
            }
        }

        let output_intent = if has_video && has_snapshot {
            OutputIntent::VideoSnapshot
        } else if has_snapshot {
            OutputIntent::Snapshot
        } else if has_video {
            OutputIntent::Video
        } else if has_zsl {
            OutputIntent::Zsl
        } else {
            OutputIntent::Preview
        };
        settings.set_u8(vendor_tags::OUTPUT_INTENT, output_intent.to_u8());
    }

    /// Prétraitement d'une requête entrante: réglages sticky, étiquette
    /// thermique, intention de sortie, remappage du zoom, import des buffers
    fn prepare_request(&self, request: &CaptureRequest) -> Result<CaptureRequest, SessionError> {
        let mut updated = request.clone();

        // Base sticky: la première requête doit porter des réglages
        {
            let mut config = self.config.lock();
            match &request.settings {
                Some(settings) => {
                    config.sticky_settings = Some(settings.clone());
                }
                None => {
                    let sticky = config.sticky_settings.clone().ok_or_else(|| {
                        SessionError::BadValue(format!(
                            "Trame {}: première requête sans réglages",
                            request.frame_number
                        ))
                    })?;
                    updated.settings = Some(sticky);
                }
            }
        }

        let settings = updated.settings.as_mut().unwrap();

        // Étiquette thermique, une fois par transition
        let throttling = self.thermal_throttling.load(Ordering::SeqCst);
        if throttling && !self.thermal_throttling_notified.swap(true, Ordering::SeqCst) {
            settings.set_u8(vendor_tags::THERMAL_THROTTLING, 1);
        }

        self.append_output_intent(request, settings);

        if let Some(zoom_mapper) = &self.zoom_mapper {
            zoom_mapper.update_capture_request(settings);
        }

        // Import des buffers du framework
        for buffer in updated
            .output_buffers
            .iter_mut()
            .chain(updated.input_buffers.iter_mut())
        {
            match buffer.buffer {
                Some(raw) => {
                    buffer.buffer =
                        Some(self.import_buffer(buffer.stream_id, buffer.buffer_id, raw)?);
                }
                None if self.buffer_management_supported => {
                    // Résolution par le cache de buffers, factice au besoin
                    let cache_manager = self.buffer_management.lock().cache_manager.clone();
                    if let Some(cache_manager) = cache_manager {
                        let cached = cache_manager.get_stream_buffer(buffer.stream_id)?;
                        if cached.is_dummy {
                            debug!(
                                "Trame {}: buffer factice pour le flux {}",
                                request.frame_number, buffer.stream_id
                            );
                            self.buffer_management
                                .lock()
                                .error_frames
                                .insert((request.frame_number, buffer.stream_id));
                        }
                        buffer.buffer = cached.buffer.buffer;
                        buffer.buffer_id = cached.buffer.buffer_id;
                    }
                }
                None => {
                    return Err(SessionError::BadValue(format!(
                        "Trame {}: buffer sans handle pour le flux {}",
                        request.frame_number, buffer.stream_id
                    )));
                }
            }
        }

        Ok(updated)
    }

    /// Court-circuit d'une requête pendant le vidage: erreur de requête et
    /// buffers en erreur, sans passage par la chaîne
    fn short_circuit_flushed_request(&self, request: &CaptureRequest) {
        let session_callback = self.session_callback.read();
        let session_callback = match session_callback.as_ref() {
            Some(session_callback) => session_callback,
            None => return,
        };

        (session_callback.notify)(NotifyMessage::Error(ErrorMessage {
            frame_number: request.frame_number,
            error_stream_id: None,
            error_code: ErrorCode::Request,
        }));

        let output_buffers = request
            .output_buffers
            .iter()
            .map(|buffer| argos_core::StreamBuffer {
                status: BufferStatus::Error,
                ..buffer.clone()
            })
            .collect();
        (session_callback.process_capture_result)(CaptureResult {
            frame_number: request.frame_number,
            output_buffers,
            ..Default::default()
        });
    }

    /// Soumet un lot de requêtes. Renvoie le nombre de requêtes traitées.
    pub fn process_capture_request(
        &self,
        requests: &[CaptureRequest],
    ) -> Result<usize, SessionError> {
        let mut processed = 0;
        for request in requests {
            if self.is_flushing.load(Ordering::SeqCst) {
                self.short_circuit_flushed_request(request);
                processed += 1;
                continue;
            }

            let updated = self.prepare_request(request)?;

            // Admission bloquante sur le budget de buffers
            let tracker = self.buffer_management.lock().tracker.clone();
            if let Some(tracker) = tracker {
                tracker.wait_and_track_request_buffers(&updated)?;
            }

            let capture_session = self.capture_session.read();
            let capture_session = capture_session.as_ref().ok_or_else(|| {
                SessionError::NoInit("Aucune session de capture configurée".to_string())
            })?;
            capture_session.process_request(&updated)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Post-traitement d'un résultat avant remise au framework
    fn process_session_result(&self, mut result: CaptureResult) {
        if let Some(zoom_mapper) = &self.zoom_mapper {
            if let Some(metadata) = result.result_metadata.as_mut() {
                zoom_mapper.update_capture_result(metadata);
            }
        }

        {
            let mut buffer_management = self.buffer_management.lock();
            if let Some(tracker) = &buffer_management.tracker {
                tracker.track_returned_result_buffers(&result.output_buffers);
            }

            // Réécriture des substitutions factices en rapports d'erreur,
            // un couple (trame, flux) à la fois: une même trame peut avoir
            // plusieurs flux substitués, livrés par des résultats séparés
            let session_callback = self.session_callback.read();
            for buffer in result.output_buffers.iter_mut() {
                if !buffer_management
                    .error_frames
                    .remove(&(result.frame_number, buffer.stream_id))
                {
                    continue;
                }
                buffer.status = BufferStatus::Error;
                // Le handle factice ne sort jamais du HAL
                buffer.buffer = None;
                if let Some(session_callback) = session_callback.as_ref() {
                    (session_callback.notify)(NotifyMessage::Error(ErrorMessage {
                        frame_number: result.frame_number,
                        error_stream_id: Some(buffer.stream_id),
                        error_code: ErrorCode::Buffer,
                    }));
                }
            }
        }

        let session_callback = self.session_callback.read();
        match session_callback.as_ref() {
            Some(session_callback) => (session_callback.process_capture_result)(result),
            None => error!("Résultat perdu: rappels de session absents"),
        }
    }

    fn process_session_notify(&self, message: NotifyMessage) {
        let session_callback = self.session_callback.read();
        match session_callback.as_ref() {
            Some(session_callback) => (session_callback.notify)(message),
            None => warn!("Notification perdue: rappels de session absents"),
        }
    }

    /// Annulation au mieux. Idempotent et non bloquant pour l'appelant; les
    /// requêtes en vol se terminent normalement.
    pub fn flush(&self) -> Result<(), SessionError> {
        let capture_session = self.capture_session.read();
        let capture_session = match capture_session.as_ref() {
            Some(capture_session) => capture_session,
            None => return Ok(()),
        };

        self.is_flushing.store(true, Ordering::SeqCst);
        let result = capture_session.flush();
        self.is_flushing.store(false, Ordering::SeqCst);
        result
    }

    /// Délègue au HWL la décision de reconfiguration
    pub fn is_reconfiguration_required(
        &self,
        old_session_params: Option<&Metadata>,
        new_session_params: Option<&Metadata>,
    ) -> Result<bool, SessionError> {
        Ok(self
            .device_session_hwl
            .is_reconfiguration_required(old_session_params, new_session_params)?)
    }
}

impl Drop for CameraDeviceSession {
    fn drop(&mut self) {
        if let Some(thermal_callback) = self.thermal_callback.lock().take() {
            (thermal_callback.unregister_thermal_changed_callback)();
        }
        *self.capture_session.write() = None;
        self.free_buffer_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argos_core::PixelFormat;
    use argos_hwl::{SimpleBufferAllocator, SimulatedHwlSession};
    use std::sync::mpsc;
    use std::time::Duration;

    fn make_session() -> (Arc<CameraDeviceSession>, Arc<SimulatedHwlSession>) {
        let mut characteristics = Metadata::new();
        characteristics.set_i32(
            tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE,
            &[0, 0, 4032, 3024],
        );
        let hwl = SimulatedHwlSession::single(0, characteristics);
        let allocator = SimpleBufferAllocator::new();
        let session = CameraDeviceSession::new(
            hwl.clone(),
            allocator.clone(),
            allocator,
            None,
            SessionOptions::default(),
        );
        (session, hwl)
    }

    fn install_callback(
        session: &Arc<CameraDeviceSession>,
    ) -> (mpsc::Receiver<CaptureResult>, mpsc::Receiver<NotifyMessage>) {
        let (result_tx, result_rx) = mpsc::channel();
        let (notify_tx, notify_rx) = mpsc::channel();
        session.set_session_callback(
            SessionCallback {
                process_capture_result: Arc::new(move |result| {
                    let _ = result_tx.send(result);
                }),
                notify: Arc::new(move |message| {
                    let _ = notify_tx.send(message);
                }),
                request_stream_buffers: Arc::new(|_, _| None),
                return_stream_buffers: Arc::new(|_| {}),
            },
            None,
        );
        (result_rx, notify_rx)
    }

    fn make_stream_config() -> StreamConfiguration {
        StreamConfiguration {
            streams: vec![Stream {
                id: 0,
                width: 640,
                height: 480,
                format: PixelFormat::Ycbcr420_888,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_buffer_cache_idempotence() {
        let (session, _hwl) = make_session();
        let raw = BufferHandle::new(77);

        let first = session.import_buffer(0, 5, raw).unwrap();
        let second = session.import_buffer(0, 5, raw).unwrap();
        assert_eq!(first, second);

        // Même clé, handle brut différent: fatal
        assert!(session.import_buffer(0, 5, BufferHandle::new(78)).is_err());

        session.remove_buffer_cache(&[(0, 5)]);
    }

    #[test]
    fn test_first_request_requires_settings() {
        let (session, _hwl) = make_session();
        let _callbacks = install_callback(&session);
        session.configure_streams(&make_stream_config()).unwrap();

        let request = CaptureRequest {
            frame_number: 1,
            settings: None,
            ..Default::default()
        };
        assert!(session.process_capture_request(&[request]).is_err());
    }

    #[test]
    fn test_sticky_settings_inherited() {
        let (session, _hwl) = make_session();
        let (result_rx, _notify_rx) = install_callback(&session);
        session.configure_streams(&make_stream_config()).unwrap();

        let mut settings = Metadata::new();
        settings.set_u8(tags::CONTROL_CAPTURE_INTENT, tags::CAPTURE_INTENT_PREVIEW);
        let first = CaptureRequest {
            frame_number: 1,
            settings: Some(settings),
            output_buffers: vec![argos_core::StreamBuffer {
                stream_id: 0,
                buffer_id: 1,
                buffer: Some(BufferHandle::new(1)),
                ..Default::default()
            }],
            ..Default::default()
        };
        let second = CaptureRequest {
            frame_number: 2,
            settings: None,
            output_buffers: vec![argos_core::StreamBuffer {
                stream_id: 0,
                buffer_id: 2,
                buffer: Some(BufferHandle::new(2)),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(session.process_capture_request(&[first, second]).unwrap(), 2);

        // Les deux trames aboutissent (métadonnées héritées de la base)
        let mut metadata_frames = Vec::new();
        for _ in 0..4 {
            if let Ok(result) = result_rx.recv_timeout(Duration::from_secs(2)) {
                if result.result_metadata.is_some() {
                    metadata_frames.push(result.frame_number);
                }
            }
        }
        assert!(metadata_frames.contains(&1));
        assert!(metadata_frames.contains(&2));
    }

    #[test]
    fn test_dummy_buffers_rewritten_per_stream() {
        let mut characteristics = Metadata::new();
        characteristics.set_i32(
            tags::SENSOR_INFO_PRE_CORRECTION_ACTIVE_ARRAY_SIZE,
            &[0, 0, 4032, 3024],
        );
        let hwl = SimulatedHwlSession::single(0, characteristics);
        hwl.set_options(argos_hwl::SimulatorOptions {
            buffer_management_supported: true,
            ..Default::default()
        });
        let allocator = SimpleBufferAllocator::new();
        let session = CameraDeviceSession::new(
            hwl,
            allocator.clone(),
            allocator,
            None,
            SessionOptions::default(),
        );
        let (result_rx, notify_rx) = install_callback(&session);

        // Deux flux de sortie
        let config = StreamConfiguration {
            streams: vec![
                Stream {
                    id: 0,
                    width: 640,
                    height: 480,
                    format: PixelFormat::Ycbcr420_888,
                    ..Default::default()
                },
                Stream {
                    id: 1,
                    width: 1280,
                    height: 720,
                    format: PixelFormat::Ycbcr420_888,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        session.configure_streams(&config).unwrap();

        // Le framework ne fournit aucun buffer: substitution factice sur
        // les deux flux de la même trame
        let request = CaptureRequest {
            frame_number: 1,
            settings: Some(Metadata::new()),
            output_buffers: vec![
                argos_core::StreamBuffer {
                    stream_id: 0,
                    buffer_id: 0,
                    buffer: None,
                    ..Default::default()
                },
                argos_core::StreamBuffer {
                    stream_id: 1,
                    buffer_id: 0,
                    buffer: None,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        session.process_capture_request(&[request]).unwrap();

        // Chacun des deux buffers, livrés par des résultats séparés, est
        // réécrit en erreur et aucun handle factice ne sort
        let mut errored_streams = std::collections::HashSet::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while errored_streams.len() < 2 {
            assert!(
                std::time::Instant::now() < deadline,
                "réécritures manquantes: {:?}",
                errored_streams
            );
            if let Ok(result) = result_rx.recv_timeout(Duration::from_millis(200)) {
                for buffer in &result.output_buffers {
                    assert_eq!(buffer.status, BufferStatus::Error);
                    assert!(buffer.buffer.is_none());
                    errored_streams.insert(buffer.stream_id);
                }
            }
        }
        assert!(errored_streams.contains(&0));
        assert!(errored_streams.contains(&1));

        // Une notification d'erreur de buffer par flux substitué
        let mut notified_streams = std::collections::HashSet::new();
        while notified_streams.len() < 2 {
            match notify_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                NotifyMessage::Error(error) => {
                    assert_eq!(error.error_code, ErrorCode::Buffer);
                    assert_eq!(error.frame_number, 1);
                    notified_streams.insert(error.error_stream_id.unwrap());
                }
                NotifyMessage::Shutter(_) => {}
            }
        }
    }

    #[test]
    fn test_output_intent_stamped() {
        let (session, _hwl) = make_session();
        let (result_rx, _notify_rx) = install_callback(&session);
        session.configure_streams(&make_stream_config()).unwrap();

        let request = CaptureRequest {
            frame_number: 1,
            settings: Some(Metadata::new()),
            output_buffers: vec![argos_core::StreamBuffer {
                stream_id: 0,
                buffer_id: 1,
                buffer: Some(BufferHandle::new(1)),
                ..Default::default()
            }],
            ..Default::default()
        };
        session.process_capture_request(&[request]).unwrap();

        // Le simulateur renvoie les réglages en métadonnées: l'intention de
        // prévisualisation doit y figurer
        loop {
            let result = result_rx.recv_timeout(Duration::from_secs(2)).unwrap();
            if let Some(metadata) = &result.result_metadata {
                assert_eq!(
                    metadata.get_u8(vendor_tags::OUTPUT_INTENT),
                    Some(OutputIntent::Preview.to_u8())
                );
                break;
            }
        }
    }
}
