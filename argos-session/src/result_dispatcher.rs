use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use argos_core::{
    CaptureRequest, CaptureResult, ErrorCode, ErrorMessage, Metadata, NotifyMessage,
    ShutterMessage, StreamBuffer,
};

use crate::{NotifyFn, ProcessCaptureResultFn, SessionError};

/// Partie métadonnées d'un résultat en attente de remise
struct MetadataPart {
    metadata: Metadata,
    partial_result: u32,
    physical_metadata: std::collections::BTreeMap<u32, Metadata>,
    input_buffers: Vec<StreamBuffer>,
}

#[derive(Default)]
struct DispatchState {
    /// Dernière trame admise, pour la croissance stricte
    last_added_frame: Option<u32>,

    /// Piste des obturations: trame → horodatage une fois arrivé
    pending_shutters: BTreeMap<u32, Option<u64>>,

    /// Trames dont l'obturation a été remise
    shutter_delivered: HashSet<u32>,

    /// Piste des métadonnées finales: trame → partie une fois arrivée
    pending_metadata: BTreeMap<u32, Option<MetadataPart>>,

    /// Trames dont la métadonnée a été remise
    metadata_delivered: HashSet<u32>,

    /// Une piste ordonnée par flux: trame → buffer une fois arrivé
    pending_buffers: HashMap<i32, BTreeMap<u32, Option<StreamBuffer>>>,

    /// Buffers d'entrée sans piste propre, rendus dès que possible
    orphan_inputs: VecDeque<(u32, Vec<StreamBuffer>)>,

    /// Réveil du thread de remise
    dirty: bool,
}

enum Delivery {
    Shutter(ShutterMessage),
    Result(CaptureResult),
}

struct Inner {
    process_capture_result: ProcessCaptureResultFn,
    notify: NotifyFn,
    metadata_first: bool,
    state: Mutex<DispatchState>,
    condvar: Condvar,
    active: AtomicBool,
}

/// Ordonnanceur de remise des résultats.
///
/// Garanties envers le framework: l'obturation d'une trame précède tout
/// résultat de la trame; les obturations sont monotones; chaque buffer
/// demandé est remis exactement une fois; chaque piste (métadonnées, buffers
/// par flux) est monotone en numéro de trame. Un unique thread de remise
/// draine des files ordonnées, les producteurs ne font que déposer.
pub struct ResultDispatcher {
    inner: Arc<Inner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ResultDispatcher {
    pub fn new(
        metadata_first: bool,
        process_capture_result: ProcessCaptureResultFn,
        notify: NotifyFn,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner {
            process_capture_result,
            notify,
            metadata_first,
            state: Mutex::new(DispatchState::default()),
            condvar: Condvar::new(),
            active: AtomicBool::new(true),
        });

        let worker_inner = inner.clone();
        let worker = thread::spawn(move || Self::run(worker_inner));

        Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enregistre une trame admise: son obturation, sa métadonnée finale et
    /// un emplacement par flux de sortie sont désormais attendus.
    pub fn add_pending_request(&self, request: &CaptureRequest) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();

        if let Some(last) = state.last_added_frame {
            if request.frame_number <= last {
                return Err(SessionError::BadValue(format!(
                    "Trame {} non croissante (dernière {})",
                    request.frame_number, last
                )));
            }
        }
        state.last_added_frame = Some(request.frame_number);

        state.pending_shutters.insert(request.frame_number, None);
        state.pending_metadata.insert(request.frame_number, None);
        for buffer in &request.output_buffers {
            state
                .pending_buffers
                .entry(buffer.stream_id)
                .or_default()
                .insert(request.frame_number, None);
        }

        Ok(())
    }

    /// Retire une trame dont l'admission a finalement échoué
    pub fn remove_pending_request(&self, frame_number: u32) {
        let mut state = self.inner.state.lock();
        state.pending_shutters.remove(&frame_number);
        state.pending_metadata.remove(&frame_number);
        for track in state.pending_buffers.values_mut() {
            track.remove(&frame_number);
        }
        state.shutter_delivered.remove(&frame_number);
        state.metadata_delivered.remove(&frame_number);
        state.dirty = true;
        self.inner.condvar.notify_one();
    }

    /// Dépose un résultat: la métadonnée rejoint sa piste, chaque buffer la
    /// piste de son flux
    pub fn add_result(&self, result: CaptureResult) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        let frame_number = result.frame_number;

        if let Some(metadata) = result.result_metadata {
            match state.pending_metadata.get_mut(&frame_number) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(MetadataPart {
                        metadata,
                        partial_result: result.partial_result,
                        physical_metadata: result.physical_metadata,
                        input_buffers: result.input_buffers,
                    });
                }
                Some(_) => {
                    warn!("Métadonnée dupliquée pour la trame {}", frame_number);
                }
                None => {
                    // Trame supprimée par une erreur de requête
                    debug!(
                        "Métadonnée ignorée pour la trame {} sans emplacement",
                        frame_number
                    );
                }
            }
        } else if !result.input_buffers.is_empty() {
            state
                .orphan_inputs
                .push_back((frame_number, result.input_buffers));
        }

        for buffer in result.output_buffers {
            let slot = state
                .pending_buffers
                .get_mut(&buffer.stream_id)
                .and_then(|track| track.get_mut(&frame_number));
            match slot {
                Some(slot) if slot.is_none() => *slot = Some(buffer),
                Some(_) => {
                    warn!(
                        "Buffer dupliqué pour la trame {} flux {}",
                        frame_number, buffer.stream_id
                    );
                }
                None => {
                    debug!(
                        "Buffer ignoré pour la trame {} flux {} sans emplacement",
                        frame_number, buffer.stream_id
                    );
                }
            }
        }

        state.dirty = true;
        self.inner.condvar.notify_one();
        Ok(())
    }

    /// Dépose l'obturation d'une trame
    pub fn add_shutter(&self, frame_number: u32, timestamp_ns: u64) {
        let mut state = self.inner.state.lock();
        match state.pending_shutters.get_mut(&frame_number) {
            Some(slot) if slot.is_none() => *slot = Some(timestamp_ns),
            Some(_) => warn!("Obturation dupliquée pour la trame {}", frame_number),
            None => debug!(
                "Obturation ignorée pour la trame {} sans emplacement",
                frame_number
            ),
        }
        state.dirty = true;
        self.inner.condvar.notify_one();
    }

    /// Dépose une erreur. La notification part immédiatement; les
    /// emplacements devenus sans objet sont retirés pour que les résultats
    /// ultérieurs de la trame soient supprimés.
    pub fn add_error(&self, error: ErrorMessage) {
        {
            let mut state = self.inner.state.lock();
            match error.error_code {
                ErrorCode::Device => {}
                ErrorCode::Request => {
                    let frame_number = error.frame_number;
                    state.pending_shutters.remove(&frame_number);
                    state.pending_metadata.remove(&frame_number);
                    for track in state.pending_buffers.values_mut() {
                        track.remove(&frame_number);
                    }
                }
                ErrorCode::Result => {
                    state.pending_metadata.remove(&error.frame_number);
                }
                ErrorCode::Buffer => {
                    // Le buffer en erreur arrivera par la piste normale
                }
            }
            state.dirty = true;
        }
        self.inner.condvar.notify_one();
        (self.inner.notify)(NotifyMessage::Error(error));
    }

    fn collect_deliveries(inner: &Inner, state: &mut DispatchState) -> Vec<Delivery> {
        let mut deliveries = Vec::new();

        // Obturations, en ordre de trame
        loop {
            let frame_number = match state.pending_shutters.iter().next() {
                Some((&frame_number, Some(_))) => frame_number,
                _ => break,
            };
            let timestamp_ns = state.pending_shutters.remove(&frame_number).unwrap().unwrap();
            state.shutter_delivered.insert(frame_number);
            deliveries.push(Delivery::Shutter(ShutterMessage {
                frame_number,
                timestamp_ns,
            }));
        }

        // Métadonnées, en ordre de trame, derrière leur obturation
        loop {
            let frame_number = match state.pending_metadata.iter().next() {
                Some((&frame_number, Some(_)))
                    if state.shutter_delivered.contains(&frame_number) =>
                {
                    frame_number
                }
                _ => break,
            };
            let part = state.pending_metadata.remove(&frame_number).unwrap().unwrap();
            state.metadata_delivered.insert(frame_number);
            deliveries.push(Delivery::Result(CaptureResult {
                frame_number,
                result_metadata: Some(part.metadata),
                partial_result: part.partial_result,
                output_buffers: Vec::new(),
                input_buffers: part.input_buffers,
                physical_metadata: part.physical_metadata,
            }));
        }

        // Buffers, une piste monotone par flux, derrière leur obturation
        let stream_ids: Vec<i32> = state.pending_buffers.keys().copied().collect();
        for stream_id in stream_ids {
            loop {
                let frame_number = {
                    let track = &state.pending_buffers[&stream_id];
                    match track.iter().next() {
                        Some((&frame_number, Some(_))) => frame_number,
                        _ => break,
                    }
                };
                if !state.shutter_delivered.contains(&frame_number) {
                    break;
                }
                if inner.metadata_first
                    && !state.metadata_delivered.contains(&frame_number)
                    && state.pending_metadata.contains_key(&frame_number)
                {
                    break;
                }

                let buffer = state
                    .pending_buffers
                    .get_mut(&stream_id)
                    .unwrap()
                    .remove(&frame_number)
                    .unwrap()
                    .unwrap();
                deliveries.push(Delivery::Result(CaptureResult {
                    frame_number,
                    result_metadata: None,
                    partial_result: 0,
                    output_buffers: vec![buffer],
                    input_buffers: Vec::new(),
                    physical_metadata: Default::default(),
                }));
            }
        }

        // Buffers d'entrée orphelins, sans contrainte d'ordre
        while let Some((frame_number, input_buffers)) = state.orphan_inputs.pop_front() {
            deliveries.push(Delivery::Result(CaptureResult {
                frame_number,
                result_metadata: None,
                partial_result: 0,
                output_buffers: Vec::new(),
                input_buffers,
                physical_metadata: Default::default(),
            }));
        }

        // Nettoyage des trames totalement remises
        let delivered: Vec<u32> = state.shutter_delivered.iter().copied().collect();
        for frame_number in delivered {
            let metadata_pending = state.pending_metadata.contains_key(&frame_number);
            let buffers_pending = state
                .pending_buffers
                .values()
                .any(|track| track.contains_key(&frame_number));
            if !metadata_pending && !buffers_pending {
                state.shutter_delivered.remove(&frame_number);
                state.metadata_delivered.remove(&frame_number);
            }
        }

        deliveries
    }

    fn run(inner: Arc<Inner>) {
        while inner.active.load(Ordering::SeqCst) {
            let deliveries = {
                let mut state = inner.state.lock();
                while !state.dirty && inner.active.load(Ordering::SeqCst) {
                    let _ = inner
                        .condvar
                        .wait_for(&mut state, Duration::from_millis(100));
                }
                state.dirty = false;
                Self::collect_deliveries(&inner, &mut state)
            };

            // Remise hors verrou
            for delivery in deliveries {
                match delivery {
                    Delivery::Shutter(shutter) => {
                        (inner.notify)(NotifyMessage::Shutter(shutter));
                    }
                    Delivery::Result(result) => {
                        (inner.process_capture_result)(result);
                    }
                }
            }
        }
    }
}

impl Drop for ResultDispatcher {
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock();
            state.dirty = true;
        }
        self.inner.condvar.notify_one();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Le thread de remise s'est terminé en panique");
            }
        }
    }
}
