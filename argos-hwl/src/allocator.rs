use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use argos_core::{BufferHandle, HalStream, Stream};

use crate::HwlError;

/// Interface d'interopérabilité avec l'allocateur graphique de la
/// plateforme. Plusieurs versions du service existent; celle retenue à
/// l'initialisation de la session est enveloppée derrière ce contrat.
///
/// Cycle de vie requis: un import exactement, une libération exactement,
/// par handle brut.
pub trait BufferInterop: Send + Sync {
    /// Importe un handle brut reçu du framework et renvoie le handle natif
    /// utilisable par les pipelines
    fn import_buffer(&self, raw_handle: BufferHandle) -> Result<BufferHandle, HwlError>;

    /// Libère un handle natif importé
    fn free_buffer(&self, handle: BufferHandle);
}

/// Allocateur de buffers pour les flux internes. Les pools du gestionnaire
/// de flux internes passent par ce contrat, jamais par l'allocateur
/// graphique directement.
pub trait InternalBufferAllocator: Send + Sync {
    /// Alloue `count` buffers pour la réalisation de flux donnée
    fn allocate_buffers(
        &self,
        stream: &Stream,
        hal_stream: &HalStream,
        count: usize,
    ) -> Result<Vec<BufferHandle>, HwlError>;

    /// Libère des buffers alloués par `allocate_buffers`
    fn free_buffers(&self, handles: &[BufferHandle]);
}

/// Allocateur simple en mémoire, utilisé par les tests et comme allocateur
/// par défaut quand le HWL ne fournit pas d'allocateur vendeur.
pub struct SimpleBufferAllocator {
    /// Prochain handle à distribuer
    next_handle: AtomicU64,

    /// Handles vivants, pour détecter les doubles libérations
    live: Mutex<std::collections::HashSet<u64>>,
}

impl SimpleBufferAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(1),
            live: Mutex::new(std::collections::HashSet::new()),
        })
    }

    /// Nombre de handles actuellement vivants
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

impl InternalBufferAllocator for SimpleBufferAllocator {
    fn allocate_buffers(
        &self,
        _stream: &Stream,
        _hal_stream: &HalStream,
        count: usize,
    ) -> Result<Vec<BufferHandle>, HwlError> {
        let mut live = self.live.lock();
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
            live.insert(raw);
            handles.push(BufferHandle::new(raw));
        }
        Ok(handles)
    }

    fn free_buffers(&self, handles: &[BufferHandle]) {
        let mut live = self.live.lock();
        for handle in handles {
            if !live.remove(&handle.raw) {
                warn!("Libération d'un handle inconnu: {}", handle.raw);
            }
        }
    }
}

impl BufferInterop for SimpleBufferAllocator {
    fn import_buffer(&self, raw_handle: BufferHandle) -> Result<BufferHandle, HwlError> {
        let mut live = self.live.lock();
        // L'import produit un handle natif distinct du handle brut
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        live.insert(raw);
        let _ = raw_handle;
        Ok(BufferHandle::new(raw))
    }

    fn free_buffer(&self, handle: BufferHandle) {
        let mut live = self.live.lock();
        if !live.remove(&handle.raw) {
            warn!("Libération d'un handle importé inconnu: {}", handle.raw);
        }
    }
}
