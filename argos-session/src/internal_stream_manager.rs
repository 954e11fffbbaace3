use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use argos_core::stream::{
    HAL_INTERNAL_STREAM_ID_START, IMPLEMENTATION_DEFINED_INTERNAL_STREAM_ID_START,
};
use argos_core::{HalStream, Metadata, Stream, StreamBuffer};
use argos_hwl::InternalBufferAllocator;

use crate::zsl_buffer_manager::ZslBufferManager;
use crate::SessionError;

/// Nombre minimal d'entrées complètes exigé dans l'anneau avant de prêter
/// des buffers à un consommateur de cliché
pub const MIN_FILLED_BUFFERS: usize = 3;

struct State {
    /// Prochain identifiant interne disponible
    next_stream_id: i32,

    /// Flux enregistrés, par identifiant
    registered_streams: HashMap<i32, Stream>,

    /// Pour un flux partageant un pool: l'identifiant du flux propriétaire
    shared_stream_owner_ids: HashMap<i32, i32>,

    /// Pools détenus, par identifiant du flux propriétaire
    buffer_managers: HashMap<i32, ZslBufferManager>,
}

/// Gestionnaire des flux invisibles du framework: anneaux RAW
/// intermédiaires, YUV de synchronisation, entrées de profondeur.
///
/// Un seul mutex grossier protège les tables; toutes les opérations sont
/// courtes. L'allocation peut bloquer sur l'allocateur externe mais jamais
/// en tenant le verrou d'un autre composant.
pub struct InternalStreamManager {
    allocator: Arc<dyn InternalBufferAllocator>,
    state: Mutex<State>,
}

impl InternalStreamManager {
    pub fn new(allocator: Arc<dyn InternalBufferAllocator>) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            state: Mutex::new(State {
                next_stream_id: HAL_INTERNAL_STREAM_ID_START,
                registered_streams: HashMap::new(),
                shared_stream_owner_ids: HashMap::new(),
                buffer_managers: HashMap::new(),
            }),
        })
    }

    /// Enregistre un flux interne et renvoie son identifiant.
    ///
    /// Si l'identifiant demandé est sous la borne réservée, un identifiant
    /// frais est attribué; sinon l'identifiant du demandeur est honoré
    /// (flux imposés par le HWL).
    pub fn register_new_internal_stream(&self, stream: &Stream) -> Result<i32, SessionError> {
        let mut state = self.state.lock();

        let stream_id = if stream.id < IMPLEMENTATION_DEFINED_INTERNAL_STREAM_ID_START {
            let id = state.next_stream_id;
            state.next_stream_id += 1;
            id
        } else {
            stream.id
        };

        if state.registered_streams.contains_key(&stream_id) {
            return Err(SessionError::AlreadyExists(format!(
                "Flux interne {} déjà enregistré",
                stream_id
            )));
        }

        let mut registered = stream.clone();
        registered.id = stream_id;
        state.registered_streams.insert(stream_id, registered);

        debug!("Flux interne {} enregistré", stream_id);
        Ok(stream_id)
    }

    fn owner_id(state: &State, stream_id: i32) -> i32 {
        state
            .shared_stream_owner_ids
            .get(&stream_id)
            .copied()
            .unwrap_or(stream_id)
    }

    /// Alloue le pool d'un flux: `hal_stream.max_buffers` immédiatement,
    /// jusqu'à `max_buffers + additional` au total
    pub fn allocate_buffers(
        &self,
        hal_stream: &HalStream,
        additional: u32,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let stream = state
            .registered_streams
            .get(&hal_stream.id)
            .cloned()
            .ok_or_else(|| {
                SessionError::NotFound(format!("Flux {} non enregistré", hal_stream.id))
            })?;

        if state.buffer_managers.contains_key(&hal_stream.id)
            || state.shared_stream_owner_ids.contains_key(&hal_stream.id)
        {
            return Err(SessionError::AlreadyExists(format!(
                "Flux {} déjà alloué",
                hal_stream.id
            )));
        }

        let manager = ZslBufferManager::new(
            stream,
            hal_stream.clone(),
            additional,
            self.allocator.clone(),
        )?;
        state.buffer_managers.insert(hal_stream.id, manager);

        info!(
            "Pool alloué pour le flux {} ({} buffers immédiats, +{} max)",
            hal_stream.id, hal_stream.max_buffers, additional
        );
        Ok(())
    }

    fn are_streams_compatible(
        stream_0: &Stream,
        hal_stream_0: &HalStream,
        stream_1: &Stream,
        hal_stream_1: &HalStream,
    ) -> bool {
        stream_0.width == stream_1.width
            && stream_0.height == stream_1.height
            && stream_0.rotation == stream_1.rotation
            && hal_stream_0.override_format == hal_stream_1.override_format
            && hal_stream_0.producer_usage == hal_stream_1.producer_usage
            && hal_stream_0.consumer_usage == hal_stream_1.consumer_usage
            && hal_stream_0.override_data_space == hal_stream_1.override_data_space
    }

    /// Alloue un pool unique partagé par plusieurs flux compatibles deux à
    /// deux. Le premier flux devient propriétaire du pool; le pool contient
    /// `max(max_buffers)` buffers immédiats et peut croître jusqu'à
    /// `sum(max_buffers) + additional`.
    pub fn allocate_shared_buffers(
        &self,
        hal_streams: &[HalStream],
        additional: u32,
    ) -> Result<(), SessionError> {
        if hal_streams.len() < 2 {
            return Err(SessionError::BadValue(format!(
                "Partage de pool impossible pour {} flux",
                hal_streams.len()
            )));
        }

        let mut state = self.state.lock();

        let mut max_buffers = 0;
        let mut total_max_buffers = 0;
        for hal_stream in hal_streams {
            if !state.registered_streams.contains_key(&hal_stream.id) {
                return Err(SessionError::NotFound(format!(
                    "Flux {} non enregistré",
                    hal_stream.id
                )));
            }
            if state.buffer_managers.contains_key(&hal_stream.id)
                || state.shared_stream_owner_ids.contains_key(&hal_stream.id)
            {
                return Err(SessionError::AlreadyExists(format!(
                    "Flux {} déjà alloué",
                    hal_stream.id
                )));
            }
            total_max_buffers += hal_stream.max_buffers;
            max_buffers = max_buffers.max(hal_stream.max_buffers);
        }

        // Compatibilité structurelle stricte entre tous les flux
        for pair in hal_streams.windows(2) {
            let stream_0 = &state.registered_streams[&pair[0].id];
            let stream_1 = &state.registered_streams[&pair[1].id];
            if !Self::are_streams_compatible(stream_0, &pair[0], stream_1, &pair[1]) {
                return Err(SessionError::BadValue(format!(
                    "Flux {} et {} incompatibles pour un pool partagé",
                    pair[0].id, pair[1].id
                )));
            }
        }

        let owner_id = hal_streams[0].id;
        let mut owner_hal_stream = hal_streams[0].clone();
        owner_hal_stream.max_buffers = max_buffers;
        let total_additional = total_max_buffers + additional - max_buffers;

        let stream = state.registered_streams[&owner_id].clone();
        let manager = ZslBufferManager::new(
            stream,
            owner_hal_stream,
            total_additional,
            self.allocator.clone(),
        )?;
        state.buffer_managers.insert(owner_id, manager);

        for hal_stream in &hal_streams[1..] {
            state.shared_stream_owner_ids.insert(hal_stream.id, owner_id);
        }

        info!(
            "Pool partagé alloué: propriétaire {}, {} flux, {} immédiats, +{} max",
            owner_id,
            hal_streams.len(),
            max_buffers,
            total_additional
        );
        Ok(())
    }

    /// Libère un flux. Si le flux possède un pool partagé, un autre flux du
    /// partage est promu propriétaire; sinon le pool est détruit.
    pub fn free_stream(&self, stream_id: i32) {
        let mut state = self.state.lock();

        if state.registered_streams.remove(&stream_id).is_none() {
            warn!("Libération d'un flux non enregistré: {}", stream_id);
            return;
        }

        if state.shared_stream_owner_ids.remove(&stream_id).is_some() {
            // Simple pointeur vers un pool partagé
            return;
        }

        if let Some(manager) = state.buffer_managers.remove(&stream_id) {
            let new_owner = state
                .shared_stream_owner_ids
                .iter()
                .find(|(_, owner)| **owner == stream_id)
                .map(|(id, _)| *id);

            match new_owner {
                Some(new_owner) => {
                    state.shared_stream_owner_ids.remove(&new_owner);
                    for owner in state.shared_stream_owner_ids.values_mut() {
                        if *owner == stream_id {
                            *owner = new_owner;
                        }
                    }
                    state.buffer_managers.insert(new_owner, manager);
                    debug!(
                        "Flux {} libéré, pool promu au flux {}",
                        stream_id, new_owner
                    );
                }
                None => {
                    debug!("Flux {} libéré, pool détruit", stream_id);
                    drop(manager);
                }
            }
        }
    }

    /// Distribue un buffer vide du pool du flux
    pub fn get_stream_buffer(&self, stream_id: i32) -> Result<StreamBuffer, SessionError> {
        let mut state = self.state.lock();
        let owner = Self::owner_id(&state, stream_id);
        let manager = state
            .buffer_managers
            .get_mut(&owner)
            .ok_or_else(|| SessionError::NotFound(format!("Flux {} sans pool", stream_id)))?;
        manager.get_empty_buffer(stream_id)
    }

    /// Restitue un buffer vide. Silencieux si le flux a disparu.
    pub fn return_stream_buffer(&self, buffer: &StreamBuffer) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let owner = Self::owner_id(&state, buffer.stream_id);
        match state.buffer_managers.get_mut(&owner) {
            Some(manager) => manager.return_empty_buffer(buffer),
            None => {
                warn!(
                    "Restitution vers un flux disparu: {} (buffer {})",
                    buffer.stream_id, buffer.buffer_id
                );
                Ok(())
            }
        }
    }

    /// Dépose un buffer rempli dans l'anneau du flux
    pub fn return_filled_buffer(
        &self,
        frame_number: u32,
        buffer: &StreamBuffer,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let owner = Self::owner_id(&state, buffer.stream_id);
        match state.buffer_managers.get_mut(&owner) {
            Some(manager) => manager.return_filled_buffer(frame_number, buffer),
            None => {
                warn!(
                    "Dépôt rempli vers un flux disparu: {} (trame {})",
                    buffer.stream_id, frame_number
                );
                Ok(())
            }
        }
    }

    /// Dépose la métadonnée appariée à une trame de l'anneau
    pub fn return_metadata(
        &self,
        stream_id: i32,
        frame_number: u32,
        metadata: &Metadata,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let owner = Self::owner_id(&state, stream_id);
        match state.buffer_managers.get_mut(&owner) {
            Some(manager) => manager.return_metadata(frame_number, metadata),
            None => {
                warn!(
                    "Dépôt de métadonnée vers un flux disparu: {} (trame {})",
                    stream_id, frame_number
                );
                Ok(())
            }
        }
    }

    /// Épingle et renvoie les `payload_frames` entrées les plus récentes de
    /// l'anneau (buffers et métadonnées appariées, en ordre croissant de
    /// trame). Échoue sans rien épingler si l'anneau est trop peu rempli.
    pub fn get_most_recent_stream_buffer(
        &self,
        stream_id: i32,
        payload_frames: usize,
    ) -> Result<(Vec<StreamBuffer>, Vec<Metadata>), SessionError> {
        let mut state = self.state.lock();
        let owner = Self::owner_id(&state, stream_id);
        let manager = state
            .buffer_managers
            .get_mut(&owner)
            .ok_or_else(|| SessionError::NotFound(format!("Flux {} sans pool", stream_id)))?;

        let entries = manager.get_most_recent_entries(payload_frames, MIN_FILLED_BUFFERS)?;
        let mut buffers = Vec::with_capacity(entries.len());
        let mut metadata = Vec::with_capacity(entries.len());
        for entry in entries {
            buffers.push(entry.buffer);
            metadata.push(entry.metadata);
        }
        Ok((buffers, metadata))
    }

    /// Désépingle les entrées prêtées pour la trame donnée et les rend à
    /// l'anneau
    pub fn return_zsl_stream_buffers(
        &self,
        frame_number: u32,
        stream_id: i32,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        let owner = Self::owner_id(&state, stream_id);
        let manager = state
            .buffer_managers
            .get_mut(&owner)
            .ok_or_else(|| SessionError::NotFound(format!("Flux {} sans pool", stream_id)))?;
        manager.return_pinned_entries(frame_number);
        Ok(())
    }

    /// Vrai si aucun cliché concurrent n'a d'entrées épinglées sur ce flux
    pub fn is_pending_buffer_empty(&self, stream_id: i32) -> bool {
        let state = self.state.lock();
        let owner = Self::owner_id(&state, stream_id);
        state
            .buffer_managers
            .get(&owner)
            .map(|manager| manager.is_pending_empty())
            .unwrap_or(true)
    }
}
