//! Simulate command implementation.
//!
//! Runs several editors against one in-process hub. Each step one editor
//! performs a random edit, batch, undo or redo and pushes it; the other
//! editors read their push channels at random, so events arrive late and
//! pushes race. At the end every editor drains its channel, editors that
//! saw a sequence gap resync, and all documents are compared.

use crate::error::CliError;
use async_trait::async_trait;
use easel_engine::{
    ApplyResult, HistoryConfig, HistoryManager, HostApplier, InjectionHandler, LiveChannel,
    MemoryPlugin, MemoryObjectHost, ObjectHost, PluginRegistry, RetryConfig, SyncConfig,
    SyncError, SyncResult, SyncSession, SyncTransport,
};
use easel_protocol::{
    FullState, FullSyncRequest, FullSyncResponse, PushEventRequest, PushEventResponse, Snapshot,
};
use easel_server::{HubConfig, HubError, SyncHub};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SHAPES: &str = "shape";
const IMAGES: &str = "image";

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Number of editors.
    pub clients: usize,
    /// Number of random actions.
    pub steps: usize,
    /// RNG seed.
    pub seed: u64,
    /// Upload a full document every this many steps.
    pub upload_every: Option<usize>,
    /// History capacity of each editor.
    pub history_limit: usize,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            clients: 3,
            steps: 200,
            seed: 1,
            upload_every: None,
            history_limit: HistoryConfig::default().max_entries,
        }
    }
}

/// Simulation result.
#[derive(Debug, Default, Serialize)]
pub struct SimulationReport {
    /// Number of editors.
    pub clients: usize,
    /// Number of steps run.
    pub steps: usize,
    /// RNG seed.
    pub seed: u64,
    /// Single edits (add, modify, remove).
    pub edits: usize,
    /// Batched edits.
    pub batches: usize,
    /// Successful undos.
    pub undos: usize,
    /// Successful redos.
    pub redos: usize,
    /// Image injections by the hub.
    pub injections: usize,
    /// Accepted full uploads.
    pub uploads: usize,
    /// Full uploads refused as stale.
    pub refused_uploads: usize,
    /// Resyncs after a sequence gap.
    pub resyncs: usize,
    /// History entries pushed.
    pub pushed_entries: usize,
    /// Remote events applied, summed over editors.
    pub events_applied: u64,
    /// Own events seen on push channels, summed over editors.
    pub echoes_ignored: u64,
    /// Final hub sequence number.
    pub sequence_id: u64,
    /// Objects in the final document.
    pub objects: usize,
    /// Whether every editor ended with the same document.
    pub converged: bool,
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(simulate(options))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            print_text_output(&report);
        }
    }

    if !report.converged {
        return Err("editors did not converge".into());
    }
    Ok(())
}

/// Runs a simulation and reports whether the editors converged.
pub async fn simulate(options: &SimulateOptions) -> Result<SimulationReport, CliError> {
    if options.clients == 0 {
        return Err(CliError::InvalidArgs("at least one client is required".into()));
    }

    let hub = Arc::new(SyncHub::new(HubConfig::default()));
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut editors = Vec::with_capacity(options.clients);
    for index in 0..options.clients {
        editors.push(Editor::join(&hub, index, options.history_limit).await?);
    }

    let mut report = SimulationReport {
        clients: options.clients,
        steps: options.steps,
        seed: options.seed,
        ..Default::default()
    };

    for step in 0..options.steps {
        let index = rng.gen_range(0..editors.len());
        let editor = &mut editors[index];
        editor.act(&mut rng, &mut report).await?;
        report.pushed_entries += editor.flush().await?;

        if rng.gen_bool(0.03) {
            hub.inject_images(vec![format!("https://images.invalid/{}.png", step)])?;
            report.injections += 1;
        }

        for editor in editors.iter_mut() {
            if rng.gen_bool(0.5) {
                editor.pump().await;
            }
        }

        if let Some(every) = options.upload_every.filter(|every| *every > 0) {
            if (step + 1) % every == 0 {
                let index = rng.gen_range(0..editors.len());
                editors[index].upload(&mut report).await?;
            }
        }
    }

    // Settle: drain every channel, then repair editors that missed events.
    loop {
        let mut handled = 0;
        for editor in editors.iter_mut() {
            handled += editor.pump().await;
        }
        if handled == 0 {
            break;
        }
    }
    for editor in editors.iter_mut() {
        if editor.session.needs_resync() {
            editor.session.resync().await?;
            editor.pump().await;
            report.resyncs += 1;
        }
    }

    let documents: Vec<(String, Vec<Snapshot>)> = editors
        .iter()
        .map(|editor| (editor.session.client_id().to_string(), editor.document()))
        .collect();
    report.converged = match check_converged(&documents) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "simulation failed");
            false
        }
    };
    for editor in &editors {
        let stats = editor.session.stats();
        report.events_applied += stats.events_applied;
        report.echoes_ignored += stats.echoes_ignored;
    }
    report.sequence_id = hub.sequence_id();
    report.objects = documents[0].1.len();

    info!(
        steps = report.steps,
        sequence_id = report.sequence_id,
        objects = report.objects,
        converged = report.converged,
        "simulation finished"
    );
    Ok(report)
}

/// Checks that every document in `documents` equals the first one.
pub fn check_converged(documents: &[(String, Vec<Snapshot>)]) -> Result<(), CliError> {
    let Some((reference, expected)) = documents.first() else {
        return Ok(());
    };
    match documents.iter().find(|(_, document)| document != expected) {
        Some((client, _)) => Err(CliError::Diverged {
            reference: reference.clone(),
            client: client.clone(),
        }),
        None => Ok(()),
    }
}

/// Transport to an in-process hub.
struct HubTransport {
    hub: Arc<SyncHub>,
}

fn hub_error(err: HubError) -> SyncError {
    if err.is_client_error() {
        SyncError::transport_fatal(err.to_string())
    } else {
        SyncError::ServerError(err.to_string())
    }
}

#[async_trait]
impl SyncTransport for HubTransport {
    async fn fetch_full_state(&self) -> SyncResult<FullState> {
        Ok(self.hub.full_state())
    }

    async fn push_events(&self, request: &PushEventRequest) -> SyncResult<PushEventResponse> {
        self.hub.push_events(request.clone()).map_err(hub_error)
    }

    async fn upload_full_state(&self, request: &FullSyncRequest) -> SyncResult<FullSyncResponse> {
        self.hub.upload_full(request.clone()).map_err(hub_error)
    }

    async fn subscribe(&self, client_id: &str) -> SyncResult<LiveChannel> {
        self.hub
            .subscribe(client_id)
            .map(LiveChannel::new)
            .map_err(hub_error)
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Creates one image object per injected URL.
struct ImageInjector {
    images: Arc<MemoryPlugin>,
}

#[async_trait]
impl InjectionHandler for ImageInjector {
    async fn add_images(&self, urls: &[String]) -> ApplyResult<()> {
        for url in urls {
            let image = Snapshot::from_parts(
                url.clone(),
                json!({ "category": IMAGES, "src": url }),
                json!({ "left": 0, "top": 0 }),
            );
            self.images.host().create(&image).await?;
        }
        Ok(())
    }
}

struct Editor {
    session: SyncSession<HubTransport>,
    channel: LiveChannel,
    shapes: Arc<MemoryPlugin>,
    images: Arc<MemoryPlugin>,
    next_object: usize,
}

impl Editor {
    async fn join(hub: &Arc<SyncHub>, index: usize, history_limit: usize) -> Result<Self, CliError> {
        let registry = Arc::new(PluginRegistry::new());
        let shapes = Arc::new(HostApplier::new(MemoryObjectHost::new()));
        let images = Arc::new(HostApplier::new(MemoryObjectHost::new()));
        registry.register(SHAPES, shapes.clone());
        registry.register(IMAGES, images.clone());

        let history = Arc::new(HistoryManager::with_config(
            HistoryConfig::new(history_limit),
            registry,
        ));
        let config = SyncConfig::new("memory://hub")
            .with_client_id(format!("editor-{}", index))
            .with_retry(RetryConfig::no_retry());
        let transport = HubTransport {
            hub: Arc::clone(hub),
        };
        let session = SyncSession::new(config, transport, history);
        session.set_injection_handler(Arc::new(ImageInjector {
            images: Arc::clone(&images),
        }));
        let channel = session.initialize().await?;

        Ok(Self {
            session,
            channel,
            shapes,
            images,
            next_object: 0,
        })
    }

    fn history(&self) -> Arc<HistoryManager> {
        Arc::clone(self.session.history())
    }

    fn shape(id: &str, rng: &mut StdRng) -> Snapshot {
        Snapshot::from_parts(
            id,
            json!({ "category": SHAPES }),
            json!({ "left": rng.gen_range(0..1000), "top": rng.gen_range(0..1000) }),
        )
    }

    fn pick(&self, rng: &mut StdRng) -> Option<Snapshot> {
        let ids = self.shapes.host().ids();
        ids.choose(rng).and_then(|id| self.shapes.host().get(id))
    }

    fn add(&mut self, rng: &mut StdRng) {
        let id = format!("{}/{}", self.session.client_id(), self.next_object);
        self.next_object += 1;
        let shape = Self::shape(&id, rng);
        self.shapes.host().insert(shape.clone());
        self.history().record_add(SHAPES, vec![shape], true);
    }

    fn modify(&mut self, rng: &mut StdRng) -> Result<(), CliError> {
        let Some(before) = self.pick(rng) else {
            self.add(rng);
            return Ok(());
        };
        let after = Self::shape(&before.id, rng);
        self.shapes.host().insert(after.clone());
        self.history().record_modify(SHAPES, vec![before], vec![after], true)?;
        Ok(())
    }

    async fn remove(&mut self, rng: &mut StdRng) -> Result<(), CliError> {
        let Some(before) = self.pick(rng) else {
            self.add(rng);
            return Ok(());
        };
        self.shapes
            .host()
            .destroy(&before.id)
            .await
            .map_err(SyncError::from)?;
        self.history().record_remove(SHAPES, vec![before], true);
        Ok(())
    }

    async fn act(&mut self, rng: &mut StdRng, report: &mut SimulationReport) -> Result<(), CliError> {
        match rng.gen_range(0..100) {
            0..=29 => {
                self.add(rng);
                report.edits += 1;
            }
            30..=49 => {
                self.modify(rng)?;
                report.edits += 1;
            }
            50..=59 => {
                self.remove(rng).await?;
                report.edits += 1;
            }
            60..=69 => {
                let history = self.history();
                let _batch = history.batch();
                self.add(rng);
                self.modify(rng)?;
                self.add(rng);
                report.batches += 1;
            }
            70..=84 => {
                if self.history().perform_undo().await? {
                    report.undos += 1;
                }
            }
            _ => {
                if self.history().perform_redo().await? {
                    report.redos += 1;
                }
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<usize, CliError> {
        let flushed = self.session.flush_outbound().await?;
        for err in &flushed.failed {
            warn!(client = %self.session.client_id(), error = %err, "push failed");
        }
        Ok(flushed.pushed)
    }

    async fn pump(&mut self) -> usize {
        self.session.drain_channel(&mut self.channel).await
    }

    async fn upload(&mut self, report: &mut SimulationReport) -> Result<(), CliError> {
        self.pump().await;
        if self.session.needs_resync() {
            self.session.resync().await?;
            report.resyncs += 1;
        }
        match self.session.upload_full_state().await {
            Ok(sequence_id) => {
                debug!(client = %self.session.client_id(), sequence_id, "document uploaded");
                report.uploads += 1;
            }
            Err(e) => {
                debug!(client = %self.session.client_id(), error = %e, "upload refused");
                report.refused_uploads += 1;
            }
        }
        Ok(())
    }

    fn document(&self) -> Vec<Snapshot> {
        let mut objects = self.shapes.host().objects();
        objects.extend(self.images.host().objects());
        objects
    }
}

fn print_text_output(report: &SimulationReport) {
    println!("Easel Sync Simulation");
    println!("=====================");
    println!();
    println!("Clients: {}  Steps: {}  Seed: {}", report.clients, report.steps, report.seed);
    println!();
    println!("Actions:");
    println!("  Edits:      {}", report.edits);
    println!("  Batches:    {}", report.batches);
    println!("  Undos:      {}", report.undos);
    println!("  Redos:      {}", report.redos);
    println!("  Injections: {}", report.injections);
    println!();
    println!("Sync:");
    println!("  Entries pushed:  {}", report.pushed_entries);
    println!("  Events applied:  {}", report.events_applied);
    println!("  Echoes ignored:  {}", report.echoes_ignored);
    println!(
        "  Uploads:         {} ({} refused)",
        report.uploads, report.refused_uploads
    );
    println!("  Resyncs:         {}", report.resyncs);
    println!("  Final sequence:  {}", report.sequence_id);
    println!();
    println!("Document: {} objects", report.objects);
    println!(
        "Result:   {}",
        if report.converged { "converged" } else { "DIVERGED" }
    );
}
