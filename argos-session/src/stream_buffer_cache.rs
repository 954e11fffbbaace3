use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use argos_core::{BufferHandle, StreamBuffer};
use argos_hwl::HwlRequestBuffersFn;

use crate::SessionError;

/// Base des identifiants de buffers factices, hors de la plage du framework
const DUMMY_BUFFER_ID_START: u64 = 1 << 48;

/// Buffer obtenu du cache, avec son origine
pub struct CachedBuffer {
    pub buffer: StreamBuffer,

    /// Vrai si le framework n'a pas pu fournir et qu'un buffer factice a
    /// été substitué: la trame correspondante doit être rapportée en erreur
    pub is_dummy: bool,
}

struct StreamCache {
    /// Buffers préchargés du framework
    cached: VecDeque<StreamBuffer>,
}

/// Cache de buffers par flux pour la gestion de buffers par le HAL.
///
/// Précharge un buffer d'avance auprès du framework pour que les demandes
/// du HWL en cours de pipeline soient servies de manière synchrone. En cas
/// d'échec du framework, substitue un buffer factice et laisse la session
/// convertir le résultat en rapport d'erreur.
pub struct StreamBufferCacheManager {
    request_stream_buffers: HwlRequestBuffersFn,
    streams: Mutex<HashMap<i32, StreamCache>>,
    next_dummy_id: AtomicU64,
    flushing: Mutex<bool>,
}

impl StreamBufferCacheManager {
    pub fn new(request_stream_buffers: HwlRequestBuffersFn) -> Self {
        Self {
            request_stream_buffers,
            streams: Mutex::new(HashMap::new()),
            next_dummy_id: AtomicU64::new(DUMMY_BUFFER_ID_START),
            flushing: Mutex::new(false),
        }
    }

    /// Enregistre un flux à précharger
    pub fn register_stream(&self, stream_id: i32) {
        self.streams.lock().entry(stream_id).or_insert(StreamCache {
            cached: VecDeque::new(),
        });
    }

    /// Signale que le producteur du flux est prêt: précharge un buffer
    /// d'avance si le cache est vide
    pub fn notify_provider_readiness(&self, stream_id: i32) {
        if *self.flushing.lock() {
            return;
        }

        let needs_fetch = {
            let streams = self.streams.lock();
            match streams.get(&stream_id) {
                Some(cache) => cache.cached.is_empty(),
                None => {
                    warn!("Préchargement d'un flux non enregistré: {}", stream_id);
                    return;
                }
            }
        };

        if needs_fetch {
            // Récupération hors verrou: l'appel au framework peut bloquer
            if let Some(buffers) = (self.request_stream_buffers)(stream_id, 1) {
                let mut streams = self.streams.lock();
                if let Some(cache) = streams.get_mut(&stream_id) {
                    cache.cached.extend(buffers);
                }
            } else {
                debug!("Préchargement refusé par le framework: flux {}", stream_id);
            }
        }
    }

    /// Fournit un buffer pour le flux: du cache, sinon du framework, sinon
    /// un buffer factice
    pub fn get_stream_buffer(&self, stream_id: i32) -> Result<CachedBuffer, SessionError> {
        {
            let mut streams = self.streams.lock();
            let cache = streams.get_mut(&stream_id).ok_or_else(|| {
                SessionError::NotFound(format!("Flux {} non enregistré au cache", stream_id))
            })?;
            if let Some(buffer) = cache.cached.pop_front() {
                return Ok(CachedBuffer {
                    buffer,
                    is_dummy: false,
                });
            }
        }

        if !*self.flushing.lock() {
            if let Some(mut buffers) = (self.request_stream_buffers)(stream_id, 1) {
                if !buffers.is_empty() {
                    return Ok(CachedBuffer {
                        buffer: buffers.remove(0),
                        is_dummy: false,
                    });
                }
            }
        }

        // Substitution d'un buffer factice
        let dummy_id = self.next_dummy_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Substitution d'un buffer factice {} pour le flux {}",
            dummy_id, stream_id
        );
        Ok(CachedBuffer {
            buffer: StreamBuffer {
                stream_id,
                buffer_id: dummy_id,
                buffer: Some(BufferHandle::new(dummy_id)),
                ..Default::default()
            },
            is_dummy: true,
        })
    }

    /// Vrai si l'identifiant provient d'une substitution factice
    pub fn is_dummy_buffer_id(buffer_id: u64) -> bool {
        buffer_id >= DUMMY_BUFFER_ID_START
    }

    /// Stoppe les préchargements et vide les caches. Renvoie les buffers
    /// du framework encore détenus, à rendre par la session.
    pub fn notify_flushing_all(&self) -> Vec<StreamBuffer> {
        *self.flushing.lock() = true;
        let mut streams = self.streams.lock();
        let mut returned = Vec::new();
        for cache in streams.values_mut() {
            returned.extend(cache.cached.drain(..));
        }
        returned
    }
}
