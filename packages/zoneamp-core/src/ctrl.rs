//! The command engine.
//!
//! Every public operation follows the same four-phase pattern:
//!
//! 1. **Resolve** the target entity by id (`NotFound` if absent).
//! 2. **Compute** the candidate post-state by merging the update over the
//!    current entity and re-checking every cross-entity invariant.
//! 3. **Effect** the hardware and stream-driver changes the difference
//!    requires. If any effect fails, those already applied are reverted in
//!    reverse order (best effort) and the command fails.
//! 4. **Commit** the in-memory mutation, schedule a snapshot save, and
//!    return the full status.
//!
//! Commands are serialized by a single async mutex; reads copy the current
//! document without entering the critical section.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{ApiError, ApiResult};
use crate::model::{
    clamp_vol, Group, GroupUpdate, Info, NewGroup, NewPreset, NewStream, Preset, PresetState,
    PresetUpdate, SourceUpdate, Status, Stream, StreamUpdate, Zone, ZoneUpdate,
    FIRST_PRESET_ID, FIRST_STREAM_ID, INPUT_LOCAL, LAST_CONFIG_ID,
};
use crate::runtime::{MockRuntime, PreampRuntime, Runtime};
use crate::settings::AppSettings;
use crate::store::Store;
use crate::stream::{
    DriverFactory, LoopbackFactory, PlayerFactory, StreamCommand, StreamInfo, StreamRegistry,
};

/// Inverse of one applied effect, replayed in reverse order on failure.
enum ReverseOp {
    /// Re-apply this zone's prior state to the runtime.
    Zone(Zone),
    /// Re-apply a source's prior digital flag.
    Source { id: usize, digital: bool },
    /// Re-bind a stream to the source it was taken from.
    Bind { stream: Stream, source_id: usize },
    /// Unbind a stream that was bound during the failed command.
    Unbind(u64),
    /// Drop a reconfigured driver and rebuild it from the prior config.
    ReplaceDriver { stream: Stream, source_id: usize },
}

/// Applies one effect and records its inverse in the reverse-op log.
/// On failure the error propagates with the log intact, so the caller
/// can replay the inverses of everything already applied.
macro_rules! effect {
    ($reverse:ident, $fut:expr, $undo:expr) => {
        match $fut.await {
            Ok(_) => $reverse.push($undo),
            Err(e) => return Err(e.into()),
        }
    };
}

/// The set/create/delete/load command engine over the state document.
///
/// Owns the id counters (ids never recycle within a process lifetime) and
/// the single writer lock serializing all mutations.
pub struct Controller {
    store: Arc<Store>,
    rt: Arc<dyn Runtime>,
    streams: Arc<StreamRegistry>,
    op_lock: AsyncMutex<()>,
    next_group_id: AtomicU64,
    next_stream_id: AtomicU64,
    next_preset_id: AtomicU64,
}

impl Controller {
    /// Builds a controller from explicit collaborators and pushes the
    /// loaded configuration out to the hardware.
    pub async fn new(
        settings: &AppSettings,
        rt: Arc<dyn Runtime>,
        factory: Arc<dyn DriverFactory>,
    ) -> ApiResult<Arc<Controller>> {
        let info = Info {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_file: settings.config_file.display().to_string(),
            mock_ctrl: settings.mock_ctrl,
            mock_streams: settings.mock_streams,
        };
        let units = settings.units.unwrap_or_else(|| rt.unit_count());
        let store = Store::load(&settings.config_file, units, info, settings.delay_saves);

        let status = store.snapshot();
        if let Err(e) = status.check_invariants() {
            log::warn!("[Ctrl] Loaded config is inconsistent ({}), using factory default", e);
            store.commit(Status::factory_default(units, status.info.clone()));
        }

        let status = store.snapshot();
        let next_group_id = status.groups.iter().map(|g| g.id + 1).max().unwrap_or(0);
        let next_stream_id = status
            .streams
            .iter()
            .map(|s| s.id + 1)
            .max()
            .unwrap_or(FIRST_STREAM_ID)
            .max(FIRST_STREAM_ID);
        let next_preset_id = status
            .presets
            .iter()
            .filter(|p| p.id != LAST_CONFIG_ID)
            .map(|p| p.id + 1)
            .max()
            .unwrap_or(FIRST_PRESET_ID)
            .max(FIRST_PRESET_ID);

        let ctrl = Arc::new(Controller {
            store,
            rt,
            streams: Arc::new(StreamRegistry::new(factory)),
            op_lock: AsyncMutex::new(()),
            next_group_id: AtomicU64::new(next_group_id),
            next_stream_id: AtomicU64::new(next_stream_id),
            next_preset_id: AtomicU64::new(next_preset_id),
        });
        ctrl.sync_hardware().await?;
        ctrl.store.schedule_save();
        Ok(ctrl)
    }

    /// Builds a controller from startup settings, selecting the mock or
    /// hardware runtime and the loopback or player driver factory.
    pub async fn bootstrap(settings: &AppSettings) -> ApiResult<Arc<Controller>> {
        let rt: Arc<dyn Runtime> = if settings.mock_ctrl {
            Arc::new(MockRuntime::new(settings.units.unwrap_or(1)))
        } else {
            Arc::new(PreampRuntime::open(&settings.i2c_device).map_err(|e| {
                ApiError::HardwareFailure {
                    reason: e.to_string(),
                    rolled_back: true,
                }
            })?)
        };
        let factory: Arc<dyn DriverFactory> = if settings.mock_streams {
            Arc::new(LoopbackFactory)
        } else {
            Arc::new(PlayerFactory::new(settings.stream_dir.clone()))
        };
        Controller::new(settings, rt, factory).await
    }

    /// Pushes the whole loaded configuration to the runtime: power rails,
    /// source routing, every zone, and any persisted stream bindings.
    async fn sync_hardware(&self) -> ApiResult<()> {
        let status = self.store.snapshot();
        self.rt.set_power(true, true).await?;
        self.rt.update_sources(&status.sources).await?;
        for z in &status.zones {
            self.rt
                .set_zone(z.id, z.source_id, z.mute, z.stby, z.vol, z.disabled)
                .await?;
        }
        for source in &status.sources {
            if let Some(stream_id) = source.stream_id() {
                if let Some(stream) = status.find_stream(stream_id) {
                    self.streams.bind(stream, source.id).await?;
                }
            }
        }
        Ok(())
    }

    /// Disconnects drivers and flushes any pending save.
    pub async fn shutdown(&self) {
        let _guard = self.op_lock.lock().await;
        self.streams.shutdown().await;
        self.store.flush();
        log::info!("[Ctrl] shutdown complete");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    /// Deep copy of the current status with derived group fields filled in
    /// and any pending persistence warning attached.
    pub fn get_state(&self) -> Status {
        let mut status = self.store.snapshot();
        status.derive_groups();
        status.warning = self.store.take_warning();
        status
    }

    /// Now-playing metadata for a stream.
    pub async fn stream_info(&self, sid: u64) -> ApiResult<StreamInfo> {
        self.store
            .snapshot()
            .find_stream(sid)
            .ok_or_else(|| ApiError::NotFound(format!("stream {}", sid)))?;
        Ok(self.streams.info(sid).await)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sources
    // ─────────────────────────────────────────────────────────────────────

    /// Updates a source's name and input routing.
    pub async fn set_source(&self, sid: usize, update: &SourceUpdate) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let mut reverse = Vec::new();
        match self.set_source_locked(sid, update, &mut reverse).await {
            Ok(()) => Ok(self.get_state()),
            Err(e) => Err(self.fail_with_revert(e, reverse).await),
        }
    }

    async fn set_source_locked(
        &self,
        sid: usize,
        update: &SourceUpdate,
        reverse: &mut Vec<ReverseOp>,
    ) -> ApiResult<()> {
        let status = self.store.snapshot();
        let source = status
            .sources
            .get(sid)
            .ok_or_else(|| ApiError::NotFound(format!("source {}", sid)))?
            .clone();
        let merged = source.apply(update)?;

        let mut candidate = status.clone();
        candidate.sources[sid] = merged.clone();

        let old_stream = source.stream_id();
        let new_stream = merged.stream_id();
        let input_changed = source.input != merged.input;

        // A stream can feed one source at a time; binding it here releases
        // the source that currently holds it.
        let mut stolen_from: Option<usize> = None;
        let mut new_entity: Option<Stream> = None;
        if let Some(ns) = new_stream {
            match status.find_stream(ns) {
                Some(stream) => new_entity = Some(stream.clone()),
                None => return Err(ApiError::NotFound(format!("stream {}", ns))),
            }
            if let Some(owner) = status.source_bound_to(ns) {
                if owner.id != sid {
                    stolen_from = Some(owner.id);
                    candidate.sources[owner.id].input = INPUT_LOCAL.to_string();
                }
            }
        }
        candidate.check_invariants()?;

        if input_changed {
            if let Some(os) = old_stream {
                if let Some(prior) = status.find_stream(os).cloned() {
                    effect!(
                        reverse,
                        self.streams.unbind(os),
                        ReverseOp::Bind {
                            stream: prior,
                            source_id: sid,
                        }
                    );
                }
            }
            if let (Some(owner_id), Some(stream)) = (stolen_from, new_entity.clone()) {
                effect!(
                    reverse,
                    self.streams.unbind(stream.id),
                    ReverseOp::Bind {
                        stream,
                        source_id: owner_id,
                    }
                );
                effect!(
                    reverse,
                    self.rt.set_source(owner_id, false),
                    ReverseOp::Source {
                        id: owner_id,
                        digital: true,
                    }
                );
            }
            if let Some(stream) = new_entity {
                let ns = stream.id;
                effect!(
                    reverse,
                    self.streams.bind(&stream, sid),
                    ReverseOp::Unbind(ns)
                );
            }
        }

        effect!(
            reverse,
            self.rt.set_source(sid, merged.is_digital()),
            ReverseOp::Source {
                id: sid,
                digital: source.is_digital(),
            }
        );

        if input_changed {
            // Refresh the routing of every zone attached to a source whose
            // input changed, so the analog/digital switch takes effect on
            // live outputs. That is this source and, when the stream was
            // taken from another source, the one that just reverted to
            // local.
            for z in candidate
                .zones
                .iter()
                .filter(|z| z.source_id == sid || Some(z.source_id) == stolen_from)
            {
                effect!(
                    reverse,
                    self.rt.set_zone(z.id, z.source_id, z.mute, z.stby, z.vol, z.disabled),
                    ReverseOp::Zone(z.clone())
                );
            }
        }

        log::info!("[Ctrl] source {} -> {:?}", sid, merged.input);
        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Zones
    // ─────────────────────────────────────────────────────────────────────

    /// Updates a zone's routing, mute, standby, volume, or disabled state.
    pub async fn set_zone(&self, zid: usize, update: &ZoneUpdate) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let mut reverse = Vec::new();
        match self.set_zone_locked(zid, update, &mut reverse).await {
            Ok(()) => Ok(self.get_state()),
            Err(e) => Err(self.fail_with_revert(e, reverse).await),
        }
    }

    async fn set_zone_locked(
        &self,
        zid: usize,
        update: &ZoneUpdate,
        reverse: &mut Vec<ReverseOp>,
    ) -> ApiResult<()> {
        let status = self.store.snapshot();
        let zone = status
            .zones
            .get(zid)
            .ok_or_else(|| ApiError::NotFound(format!("zone {}", zid)))?
            .clone();
        let merged = zone.apply(update)?;

        let mut candidate = status.clone();
        candidate.zones[zid] = merged.clone();
        candidate.check_invariants()?;

        effect!(
            reverse,
            self.rt.set_zone(
                zid,
                merged.source_id,
                merged.mute,
                merged.stby,
                merged.vol,
                merged.disabled
            ),
            ReverseOp::Zone(zone)
        );

        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a group of zones; returns the created group with derived
    /// fields filled in.
    pub async fn create_group(&self, new: NewGroup) -> ApiResult<Group> {
        let _guard = self.op_lock.lock().await;
        if new.name.is_empty() {
            return Err(ApiError::InvalidField("group name must not be empty".into()));
        }
        let status = self.store.snapshot();
        let mut group = Group {
            id: self.next_group_id.fetch_add(1, Ordering::SeqCst),
            name: new.name,
            zones: Group::normalize_zones(&new.zones),
            source_id: None,
            mute: None,
            vol_delta: None,
        };
        let mut candidate = status;
        candidate.groups.push(group.clone());
        candidate.check_invariants()?;
        group.derive(&candidate.zones);
        log::info!("[Ctrl] created group {} ({:?})", group.id, group.name);
        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(group)
    }

    /// Updates a group. Name/membership edits are metadata; `source_id`,
    /// `mute`, and `vol_delta` fan out to every member zone as one
    /// transaction: either all member updates commit or none do.
    pub async fn set_group(&self, gid: u64, update: &GroupUpdate) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let mut reverse = Vec::new();
        match self.set_group_locked(gid, update, &mut reverse).await {
            Ok(()) => Ok(self.get_state()),
            Err(e) => Err(self.fail_with_revert(e, reverse).await),
        }
    }

    async fn set_group_locked(
        &self,
        gid: u64,
        update: &GroupUpdate,
        reverse: &mut Vec<ReverseOp>,
    ) -> ApiResult<()> {
        let status = self.store.snapshot();
        let group = status
            .find_group(gid)
            .ok_or_else(|| ApiError::NotFound(format!("group {}", gid)))?
            .clone();

        let name = update.name.clone().unwrap_or_else(|| group.name.clone());
        if name.is_empty() {
            return Err(ApiError::InvalidField("group name must not be empty".into()));
        }
        let zones = update
            .zones
            .as_deref()
            .map(Group::normalize_zones)
            .unwrap_or_else(|| group.zones.clone());

        let mut candidate = status.clone();
        {
            let g = candidate.find_group_mut(gid).expect("resolved above");
            g.name = name;
            g.zones = zones.clone();
        }

        // Fan the group-level controls out to each member as an ordinary
        // zone update, saturating volume adjustments at the dB bounds.
        let mut member_updates: Vec<Zone> = Vec::new();
        if update.source_id.is_some() || update.mute.is_some() || update.vol_delta.is_some() {
            for &zid in &zones {
                let zone = candidate.zones.get(zid).ok_or_else(|| {
                    ApiError::InvariantViolation(format!(
                        "group {} references missing zone {}",
                        gid, zid
                    ))
                })?;
                let zone_update = ZoneUpdate {
                    source_id: update.source_id,
                    mute: update.mute,
                    vol: update
                        .vol_delta
                        .map(|d| clamp_vol(zone.vol as i32 + d as i32)),
                    ..Default::default()
                };
                member_updates.push(zone.apply(&zone_update)?);
            }
            for z in &member_updates {
                candidate.zones[z.id] = z.clone();
            }
        }
        candidate.check_invariants()?;

        for z in &member_updates {
            let prior = status.zones[z.id].clone();
            effect!(
                reverse,
                self.rt
                    .set_zone(z.id, z.source_id, z.mute, z.stby, z.vol, z.disabled),
                ReverseOp::Zone(prior)
            );
        }

        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(())
    }

    /// Deletes a group. No hardware effect.
    pub async fn delete_group(&self, gid: u64) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let mut candidate = self.store.snapshot();
        if candidate.find_group(gid).is_none() {
            return Err(ApiError::NotFound(format!("group {}", gid)));
        }
        candidate.groups.retain(|g| g.id != gid);
        log::info!("[Ctrl] deleted group {}", gid);
        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(self.get_state())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Streams
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a stream. The driver is not instantiated until the stream
    /// is first bound to a source.
    pub async fn create_stream(&self, new: NewStream) -> ApiResult<Stream> {
        let _guard = self.op_lock.lock().await;
        let stream = Stream {
            id: self.next_stream_id.fetch_add(1, Ordering::SeqCst),
            name: new.name,
            kind: new.kind,
            user: new.user,
            password: new.password,
            url: new.url,
            station: new.station,
        };
        stream.validate()?;
        let mut candidate = self.store.snapshot();
        candidate.streams.push(stream.clone());
        candidate.check_invariants()?;
        log::info!(
            "[Ctrl] created {} stream {} ({:?})",
            stream.kind.as_str(),
            stream.id,
            stream.name
        );
        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(stream)
    }

    /// Updates a stream's configuration. If the stream is currently bound
    /// and a field the driver depends on changes, the driver is rebuilt.
    pub async fn set_stream(&self, sid: u64, update: &StreamUpdate) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let mut reverse = Vec::new();
        match self.set_stream_locked(sid, update, &mut reverse).await {
            Ok(()) => Ok(self.get_state()),
            Err(e) => Err(self.fail_with_revert(e, reverse).await),
        }
    }

    async fn set_stream_locked(
        &self,
        sid: u64,
        update: &StreamUpdate,
        reverse: &mut Vec<ReverseOp>,
    ) -> ApiResult<()> {
        let status = self.store.snapshot();
        let stream = status
            .find_stream(sid)
            .ok_or_else(|| ApiError::NotFound(format!("stream {}", sid)))?
            .clone();
        let merged = stream.apply(update)?;

        let mut candidate = status.clone();
        *candidate.find_stream_mut(sid).expect("resolved above") = merged.clone();
        candidate.check_invariants()?;

        if let Some(source_id) = self.streams.binding(sid) {
            if stream.reconnect_needed(&merged) {
                if let Err(e) = self.streams.reconnect(&merged).await {
                    // Best-effort restore of the previous config's driver so
                    // the bound source keeps playing the old stream.
                    self.streams.remove(sid);
                    if self.streams.bind(&stream, source_id).await.is_err() {
                        log::error!("[Ctrl] stream {} left disconnected after failed update", sid);
                    }
                    return Err(e);
                }
                reverse.push(ReverseOp::ReplaceDriver {
                    stream: stream.clone(),
                    source_id,
                });
            }
        }

        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(())
    }

    /// Deletes a stream. Fails with `InUse` while any source is bound to it.
    pub async fn delete_stream(&self, sid: u64) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let status = self.store.snapshot();
        if status.find_stream(sid).is_none() {
            return Err(ApiError::NotFound(format!("stream {}", sid)));
        }
        if let Some(owner) = status.source_bound_to(sid) {
            return Err(ApiError::InUse(sid, owner.id));
        }
        let mut candidate = status;
        candidate.streams.retain(|s| s.id != sid);
        candidate.check_invariants()?;
        self.streams.remove(sid);
        log::info!("[Ctrl] deleted stream {}", sid);
        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(self.get_state())
    }

    /// Dispatches a playback command to a bound stream's driver.
    pub async fn exec_stream_command(&self, sid: u64, cmd: &StreamCommand) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let status = self.store.snapshot();
        let stream = status
            .find_stream(sid)
            .ok_or_else(|| ApiError::NotFound(format!("stream {}", sid)))?
            .clone();
        self.streams.command(&stream, cmd).await?;
        // A station change sticks: it becomes the stream's configured
        // station for future connects.
        if let StreamCommand::Station(id) = cmd {
            let mut candidate = status;
            candidate
                .find_stream_mut(sid)
                .expect("resolved above")
                .station = Some(id.to_string());
            self.store.commit(candidate);
            self.store.schedule_save();
        }
        Ok(self.get_state())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Presets
    // ─────────────────────────────────────────────────────────────────────

    /// Creates a preset from a validated sparse configuration.
    pub async fn create_preset(&self, new: NewPreset) -> ApiResult<Preset> {
        let _guard = self.op_lock.lock().await;
        if new.name.is_empty() {
            return Err(ApiError::InvalidField("preset name must not be empty".into()));
        }
        new.state.validate()?;
        let preset = Preset {
            id: self.next_preset_id.fetch_add(1, Ordering::SeqCst),
            name: new.name,
            state: new.state,
            last_used: None,
        };
        let mut candidate = self.store.snapshot();
        candidate.presets.push(preset.clone());
        candidate.check_invariants()?;
        log::info!("[Ctrl] created preset {} ({:?})", preset.id, preset.name);
        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(preset)
    }

    /// Updates a preset's name or stored state.
    pub async fn set_preset(&self, pid: u64, update: &PresetUpdate) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let mut candidate = self.store.snapshot();
        let preset = candidate
            .find_preset_mut(pid)
            .ok_or_else(|| ApiError::NotFound(format!("preset {}", pid)))?;
        if let Some(name) = &update.name {
            if name.is_empty() {
                return Err(ApiError::InvalidField("preset name must not be empty".into()));
            }
            preset.name = name.clone();
        }
        if let Some(state) = &update.state {
            state.validate()?;
            preset.state = state.clone();
        }
        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(self.get_state())
    }

    /// Deletes a preset.
    pub async fn delete_preset(&self, pid: u64) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let mut candidate = self.store.snapshot();
        if candidate.find_preset(pid).is_none() {
            return Err(ApiError::NotFound(format!("preset {}", pid)));
        }
        candidate.presets.retain(|p| p.id != pid);
        self.store.commit(candidate);
        self.store.schedule_save();
        Ok(self.get_state())
    }

    /// Applies a preset's partial configuration atomically.
    ///
    /// The current configuration is first captured into the reserved
    /// last-config preset, so loading id 9999 afterwards reverts this
    /// load. Sections apply in dependency order (streams, sources, zones,
    /// groups); any failure restores the prior document and replays the
    /// hardware reverse-op log.
    pub async fn load_preset(&self, pid: u64) -> ApiResult<Status> {
        let _guard = self.op_lock.lock().await;
        let before = self.store.snapshot();
        let preset = before
            .find_preset(pid)
            .ok_or_else(|| ApiError::NotFound(format!("preset {}", pid)))?
            .clone();

        // Capture the pre-load configuration, replacing any prior capture.
        // The preset to load was resolved above, so this also works when
        // loading the last-config preset itself (toggling back and forth).
        let mut working = before.clone();
        let last = Preset {
            id: LAST_CONFIG_ID,
            name: "Restore last config".to_string(),
            state: before.capture(),
            last_used: None,
        };
        match working.find_preset_mut(LAST_CONFIG_ID) {
            Some(p) => *p = last,
            None => working.presets.push(last),
        }
        self.store.commit(working);

        let mut reverse = Vec::new();
        let result = match self.apply_preset_state(&preset.state, &mut reverse).await {
            Ok(()) => {
                // Re-assert the final source routing as one batch write.
                let applied = self.store.snapshot();
                self.rt
                    .update_sources(&applied.sources)
                    .await
                    .map_err(Into::into)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            let rolled_back = self.revert(reverse).await;
            self.store.commit(before);
            self.store.schedule_save();
            log::warn!("[Ctrl] preset {} load failed: {}", pid, e);
            return Err(flag_rollback(e, rolled_back));
        }

        let mut after = self.store.snapshot();
        if let Some(p) = after.find_preset_mut(pid) {
            p.last_used = Some(now_secs());
        }
        log::info!("[Ctrl] loaded preset {} ({:?})", pid, preset.name);
        self.store.commit(after);
        self.store.schedule_save();
        Ok(self.get_state())
    }

    /// Applies each present section through the ordinary command paths,
    /// threading one shared reverse-op log through every step.
    async fn apply_preset_state(
        &self,
        state: &PresetState,
        reverse: &mut Vec<ReverseOp>,
    ) -> ApiResult<()> {
        for patch in state.streams.iter().flatten() {
            self.set_stream_locked(patch.id, &patch.update, reverse).await?;
        }
        for patch in state.sources.iter().flatten() {
            self.set_source_locked(patch.id, &patch.update, reverse).await?;
        }
        for patch in state.zones.iter().flatten() {
            self.set_zone_locked(patch.id, &patch.update, reverse).await?;
        }
        for patch in state.groups.iter().flatten() {
            self.set_group_locked(patch.id, &patch.update, reverse).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Rollback
    // ─────────────────────────────────────────────────────────────────────

    /// Replays the reverse-op log in reverse order. Returns whether every
    /// revert succeeded.
    async fn revert(&self, ops: Vec<ReverseOp>) -> bool {
        let mut ok = true;
        for op in ops.into_iter().rev() {
            let result: ApiResult<()> = match op {
                ReverseOp::Zone(z) => self
                    .rt
                    .set_zone(z.id, z.source_id, z.mute, z.stby, z.vol, z.disabled)
                    .await
                    .map_err(Into::into),
                ReverseOp::Source { id, digital } => {
                    self.rt.set_source(id, digital).await.map_err(Into::into)
                }
                ReverseOp::Bind { stream, source_id } => {
                    self.streams.bind(&stream, source_id).await
                }
                ReverseOp::Unbind(id) => self.streams.unbind(id).await,
                ReverseOp::ReplaceDriver { stream, source_id } => {
                    self.streams.remove(stream.id);
                    self.streams.bind(&stream, source_id).await
                }
            };
            if let Err(e) = result {
                log::error!("[Ctrl] revert step failed: {}", e);
                ok = false;
            }
        }
        ok
    }

    /// Reverts applied effects and stamps the rollback outcome into the
    /// error where it carries one.
    async fn fail_with_revert(&self, err: ApiError, reverse: Vec<ReverseOp>) -> ApiError {
        if reverse.is_empty() {
            return err;
        }
        let ok = self.revert(reverse).await;
        flag_rollback(err, ok)
    }
}

fn flag_rollback(mut err: ApiError, ok: bool) -> ApiError {
    if let ApiError::HardwareFailure { rolled_back, .. } = &mut err {
        *rolled_back = ok;
    }
    err
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourcePatch, StreamKind, ZonePatch};
    use crate::runtime::ZoneCall;

    struct TestCtrl {
        ctrl: Arc<Controller>,
        rt: Arc<MockRuntime>,
        _dir: tempfile::TempDir,
    }

    async fn test_ctrl() -> TestCtrl {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings {
            config_file: dir.path().join("house.json"),
            delay_saves: false,
            ..Default::default()
        };
        let rt = Arc::new(MockRuntime::new(1));
        let ctrl = Controller::new(&settings, rt.clone(), Arc::new(LoopbackFactory))
            .await
            .unwrap();
        TestCtrl {
            ctrl,
            rt,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn fresh_boot_returns_factory_default() {
        let t = test_ctrl().await;
        let status = t.ctrl.get_state();
        assert_eq!(status.sources.len(), 4);
        for (i, source) in status.sources.iter().enumerate() {
            assert_eq!(source.name, format!("Source {}", i + 1));
            assert_eq!(source.input, "local");
        }
        assert_eq!(status.zones.len(), 6);
        for zone in &status.zones {
            assert_eq!(zone.source_id, 0);
            assert_eq!(zone.vol, 0);
            assert!(!zone.mute && !zone.stby && !zone.disabled);
        }
        assert!(!status.groups.is_empty());
        assert!(!status.streams.is_empty());
    }

    #[tokio::test]
    async fn boot_powers_up_and_syncs_zones() {
        let t = test_ctrl().await;
        assert_eq!(*t.rt.last_power.lock(), Some((true, true)));
        assert_eq!(t.rt.last_zone.lock().len(), 6);
    }

    #[tokio::test]
    async fn route_zone_to_source() {
        let t = test_ctrl().await;
        let status = t
            .ctrl
            .set_zone(
                0,
                &ZoneUpdate {
                    source_id: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(status.zones[0].source_id, 2);
        assert_eq!(
            t.rt.last_zone.lock().get(&0),
            Some(&ZoneCall {
                source_id: 2,
                mute: false,
                stby: false,
                vol: 0,
                disabled: false
            })
        );
    }

    #[tokio::test]
    async fn set_zone_rejects_bad_source() {
        let t = test_ctrl().await;
        let err = t
            .ctrl
            .set_zone(
                0,
                &ZoneUpdate {
                    source_id: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidField(_)));
        assert_eq!(t.ctrl.get_state().zones[0].source_id, 0);
    }

    #[tokio::test]
    async fn set_zone_unknown_id_is_not_found() {
        let t = test_ctrl().await;
        let err = t.ctrl.set_zone(42, &ZoneUpdate::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn group_mute_propagates_to_members() {
        let t = test_ctrl().await;
        let group = t
            .ctrl
            .create_group(NewGroup {
                name: "Main Floor".into(),
                zones: vec![0, 1, 2],
            })
            .await
            .unwrap();
        let status = t
            .ctrl
            .set_group(
                group.id,
                &GroupUpdate {
                    mute: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for zid in [0, 1, 2] {
            assert!(status.zones[zid].mute);
        }
        let derived = status.find_group(group.id).unwrap();
        assert_eq!(derived.mute, Some(true));
    }

    #[tokio::test]
    async fn group_source_change_rolls_back_on_hardware_failure() {
        let t = test_ctrl().await;
        let group = t
            .ctrl
            .create_group(NewGroup {
                name: "Main Floor".into(),
                zones: vec![0, 1, 2],
            })
            .await
            .unwrap();
        t.rt.fail_zone(1);
        let err = t
            .ctrl
            .set_group(
                group.id,
                &GroupUpdate {
                    source_id: Some(3),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::HardwareFailure {
                rolled_back: true,
                ..
            }
        ));
        let status = t.ctrl.get_state();
        for zid in [0, 1, 2] {
            assert_eq!(status.zones[zid].source_id, 0, "zone {} must be unchanged", zid);
        }
        // Zone 0 was re-applied to hardware during rollback.
        assert_eq!(t.rt.last_zone.lock().get(&0).unwrap().source_id, 0);
    }

    #[tokio::test]
    async fn group_vol_delta_saturates() {
        let t = test_ctrl().await;
        let group = t
            .ctrl
            .create_group(NewGroup {
                name: "Main Floor".into(),
                zones: vec![0, 1],
            })
            .await
            .unwrap();
        t.ctrl
            .set_zone(0, &ZoneUpdate { vol: Some(-78), ..Default::default() })
            .await
            .unwrap();
        t.ctrl
            .set_zone(1, &ZoneUpdate { vol: Some(-1), ..Default::default() })
            .await
            .unwrap();
        let status = t
            .ctrl
            .set_group(
                group.id,
                &GroupUpdate {
                    vol_delta: Some(-2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(status.zones[0].vol, -79); // saturated at the floor
        assert_eq!(status.zones[1].vol, -3);

        let status = t
            .ctrl
            .set_group(
                group.id,
                &GroupUpdate {
                    vol_delta: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(status.zones[0].vol, -69);
        assert_eq!(status.zones[1].vol, 0); // saturated at the ceiling
    }

    #[tokio::test]
    async fn create_group_rejects_disabled_member() {
        let t = test_ctrl().await;
        // Drop zone 5 from every group it belongs to so it can be disabled.
        let status = t.ctrl.get_state();
        for group in status.groups.iter().filter(|g| g.zones.contains(&5)) {
            let remaining: Vec<usize> =
                group.zones.iter().copied().filter(|&z| z != 5).collect();
            t.ctrl
                .set_group(
                    group.id,
                    &GroupUpdate {
                        zones: Some(remaining),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        t.ctrl
            .set_zone(5, &ZoneUpdate { disabled: Some(true), ..Default::default() })
            .await
            .unwrap();
        let err = t
            .ctrl
            .create_group(NewGroup {
                name: "Broken".into(),
                zones: vec![5],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn group_ids_are_monotonic_and_never_recycle() {
        let t = test_ctrl().await;
        let a = t
            .ctrl
            .create_group(NewGroup { name: "A".into(), zones: vec![0] })
            .await
            .unwrap();
        t.ctrl.delete_group(a.id).await.unwrap();
        let b = t
            .ctrl
            .create_group(NewGroup { name: "B".into(), zones: vec![0] })
            .await
            .unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn stream_rebind_moves_binding_between_sources() {
        let t = test_ctrl().await;
        let stream_id = t.ctrl.get_state().streams[0].id;
        let input = format!("stream={}", stream_id);

        t.ctrl
            .set_source(0, &SourceUpdate { input: Some(input.clone()), ..Default::default() })
            .await
            .unwrap();
        let calls_before = *t.rt.zone_calls.lock();
        let status = t
            .ctrl
            .set_source(1, &SourceUpdate { input: Some(input.clone()), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(status.sources[0].input, "local");
        assert_eq!(status.sources[1].input, input);
        // The driver followed the binding to its new source.
        assert_eq!(t.ctrl.streams.binding(stream_id), Some(1));
        // Runtime saw source 0 drop back to analog and source 1 go digital.
        let last = t.rt.last_source.lock();
        assert_eq!(last.get(&0), Some(&false));
        assert_eq!(last.get(&1), Some(&true));
        drop(last);
        // Every zone routed to the stolen source was refreshed after its
        // input reverted to local (all six default zones sit on source 0).
        assert_eq!(*t.rt.zone_calls.lock(), calls_before + 6);
    }

    #[tokio::test]
    async fn set_source_to_unknown_stream_is_not_found() {
        let t = test_ctrl().await;
        let err = t
            .ctrl
            .set_source(
                0,
                &SourceUpdate {
                    input: Some("stream=4242".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert_eq!(t.ctrl.get_state().sources[0].input, "local");
    }

    #[tokio::test]
    async fn delete_bound_stream_fails_until_unbound() {
        let t = test_ctrl().await;
        let stream_id = t.ctrl.get_state().streams[0].id;
        t.ctrl
            .set_source(
                0,
                &SourceUpdate {
                    input: Some(format!("stream={}", stream_id)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = t.ctrl.delete_stream(stream_id).await.unwrap_err();
        assert!(matches!(err, ApiError::InUse(_, 0)));

        t.ctrl
            .set_source(0, &SourceUpdate { input: Some("local".into()), ..Default::default() })
            .await
            .unwrap();
        t.ctrl.delete_stream(stream_id).await.unwrap();
        assert!(t.ctrl.get_state().find_stream(stream_id).is_none());
    }

    #[tokio::test]
    async fn stream_commands_require_binding_and_kind_support() {
        let t = test_ctrl().await;
        let stream_id = t.ctrl.get_state().streams[0].id; // internet radio
        let err = t
            .ctrl
            .exec_stream_command(stream_id, &StreamCommand::Play)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotBound(_)));

        t.ctrl
            .set_source(
                0,
                &SourceUpdate {
                    input: Some(format!("stream={}", stream_id)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        t.ctrl
            .exec_stream_command(stream_id, &StreamCommand::Play)
            .await
            .unwrap();
        let err = t
            .ctrl
            .exec_stream_command(stream_id, &StreamCommand::Ban)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UnsupportedCommand { .. }));
    }

    #[tokio::test]
    async fn exec_command_unknown_stream_is_not_found() {
        let t = test_ctrl().await;
        let err = t
            .ctrl
            .exec_stream_command(4242, &StreamCommand::Play)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_pandora_stream_and_select_station() {
        let t = test_ctrl().await;
        let stream = t
            .ctrl
            .create_stream(NewStream {
                name: "My Pandora".into(),
                kind: StreamKind::Pandora,
                user: Some("user@example.com".into()),
                password: Some("secret".into()),
                url: None,
                station: None,
            })
            .await
            .unwrap();
        assert!(stream.id >= FIRST_STREAM_ID);

        t.ctrl
            .set_source(
                2,
                &SourceUpdate {
                    input: Some(format!("stream={}", stream.id)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let status = t
            .ctrl
            .exec_stream_command(stream.id, &StreamCommand::Station(4610303469018478727))
            .await
            .unwrap();
        assert_eq!(
            status.find_stream(stream.id).unwrap().station.as_deref(),
            Some("4610303469018478727")
        );
    }

    #[tokio::test]
    async fn preset_load_applies_and_last_config_reverts() {
        let t = test_ctrl().await;
        t.ctrl
            .set_zone(0, &ZoneUpdate { vol: Some(-12), ..Default::default() })
            .await
            .unwrap();
        let before = t.ctrl.get_state();

        let preset = t
            .ctrl
            .create_preset(NewPreset {
                name: "Evening".into(),
                state: PresetState {
                    zones: Some(vec![
                        ZonePatch {
                            id: 0,
                            update: ZoneUpdate { vol: Some(-40), mute: Some(true), ..Default::default() },
                        },
                        ZonePatch {
                            id: 1,
                            update: ZoneUpdate { source_id: Some(2), ..Default::default() },
                        },
                    ]),
                    ..Default::default()
                },
            })
            .await
            .unwrap();

        let loaded = t.ctrl.load_preset(preset.id).await.unwrap();
        assert_eq!(loaded.zones[0].vol, -40);
        assert!(loaded.zones[0].mute);
        assert_eq!(loaded.zones[1].source_id, 2);
        assert!(loaded.find_preset(preset.id).unwrap().last_used.is_some());
        assert!(loaded.find_preset(LAST_CONFIG_ID).is_some());

        let reverted = t.ctrl.load_preset(LAST_CONFIG_ID).await.unwrap();
        assert_eq!(reverted.zones[0].vol, before.zones[0].vol);
        assert_eq!(reverted.zones[0].mute, before.zones[0].mute);
        assert_eq!(reverted.zones[1].source_id, before.zones[1].source_id);
    }

    #[tokio::test]
    async fn preset_referencing_missing_stream_restores_prior_state() {
        let t = test_ctrl().await;
        let preset = t
            .ctrl
            .create_preset(NewPreset {
                name: "Broken".into(),
                state: PresetState {
                    sources: Some(vec![SourcePatch {
                        id: 0,
                        update: SourceUpdate {
                            input: Some("stream=4242".into()),
                            ..Default::default()
                        },
                    }]),
                    zones: Some(vec![ZonePatch {
                        id: 0,
                        update: ZoneUpdate { vol: Some(-70), ..Default::default() },
                    }]),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        let before = t.ctrl.get_state();
        let err = t.ctrl.load_preset(preset.id).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        let after = t.ctrl.get_state();
        assert_eq!(after.sources, before.sources);
        assert_eq!(after.zones, before.zones);
    }

    #[tokio::test]
    async fn preset_load_failure_mid_zone_restores_hardware() {
        let t = test_ctrl().await;
        let preset = t
            .ctrl
            .create_preset(NewPreset {
                name: "Partial".into(),
                state: PresetState {
                    zones: Some(vec![
                        ZonePatch {
                            id: 0,
                            update: ZoneUpdate { vol: Some(-50), ..Default::default() },
                        },
                        ZonePatch {
                            id: 1,
                            update: ZoneUpdate { vol: Some(-50), ..Default::default() },
                        },
                    ]),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        t.rt.fail_zone(1);
        let err = t.ctrl.load_preset(preset.id).await.unwrap_err();
        assert!(matches!(err, ApiError::HardwareFailure { .. }));
        let after = t.ctrl.get_state();
        assert_eq!(after.zones[0].vol, 0);
        // Hardware got zone 0 back to its prior volume.
        assert_eq!(t.rt.last_zone.lock().get(&0).unwrap().vol, 0);
    }

    #[tokio::test]
    async fn mutating_ops_persist_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings {
            config_file: dir.path().join("house.json"),
            delay_saves: false,
            ..Default::default()
        };
        let rt = Arc::new(MockRuntime::new(1));
        let ctrl = Controller::new(&settings, rt, Arc::new(LoopbackFactory))
            .await
            .unwrap();
        ctrl.set_zone(0, &ZoneUpdate { vol: Some(-30), ..Default::default() })
            .await
            .unwrap();
        drop(ctrl);

        let rt = Arc::new(MockRuntime::new(1));
        let reloaded = Controller::new(&settings, rt, Arc::new(LoopbackFactory))
            .await
            .unwrap();
        assert_eq!(reloaded.get_state().zones[0].vol, -30);
    }
}
