//! eBPF program loader
//!
//! Handles loading the stage forwarder and attaching it to the mqnic
//! driver's timestamp tracepoints.

use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, HashMap, MapData},
    programs::TracePoint,
    Bpf,
};
use log::{info, warn};
use nic_ts_common::constants::*;
use std::{collections::BTreeMap, path::PathBuf};

/// eBPF program name and the driver tracepoint it attaches to
pub const STAGE_PROGRAMS: [(&str, &str); 4] = [
    ("mqnic_tx_enqueue", TRACEPOINT_TX_ENQUEUE),
    ("mqnic_tx_completion", TRACEPOINT_TX_COMPLETION),
    ("mqnic_rx_completion", TRACEPOINT_RX_COMPLETION),
    ("mqnic_rx_deliver", TRACEPOINT_RX_DELIVER),
];

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        info!("Loading eBPF program...");

        let ebpf = if let Some(obj_path) = path {
            info!("Loading eBPF object from: {:?}", obj_path);
            let data = std::fs::read(&obj_path)
                .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?;
            Bpf::load(&data).context("Failed to load eBPF program")?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("Loading embedded eBPF program...");
                let data = include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../kernel/target/bpfel-unknown-none/release/nic-ts-ebpf"
                ));
                Bpf::load(data).context("Failed to load embedded eBPF program")?
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "No eBPF object file provided. Use --ebpf-object or compile with 'embedded' feature"
                );
            }
        };

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Attach the stage forwarders to the driver tracepoints
    ///
    /// A driver build may expose only some stages; missing ones are
    /// warned about. Fails when no stage could be attached.
    pub fn attach_tracepoints(&mut self) -> Result<usize> {
        info!("Attaching tracepoints under {}...", TRACEPOINT_CATEGORY);
        let mut attached = 0;

        for (program_name, tracepoint) in STAGE_PROGRAMS {
            let program: &mut TracePoint = match self.ebpf.program_mut(program_name) {
                Some(prog) => prog
                    .try_into()
                    .with_context(|| format!("Failed to get {} as TracePoint", program_name))?,
                None => {
                    warn!("  ⚠ {} program not found in eBPF object", program_name);
                    continue;
                }
            };
            program
                .load()
                .with_context(|| format!("Failed to load {}", program_name))?;

            match program.attach(TRACEPOINT_CATEGORY, tracepoint) {
                Ok(_) => {
                    info!("  ✓ Attached to {}:{}", TRACEPOINT_CATEGORY, tracepoint);
                    attached += 1;
                }
                Err(e) => warn!(
                    "  ⚠ Failed to attach {}:{} (driver not loaded or built without probes?): {}",
                    TRACEPOINT_CATEGORY, tracepoint, e
                ),
            }
        }

        if attached == 0 {
            anyhow::bail!(
                "No {} tracepoints could be attached; is the instrumented mqnic driver loaded?",
                TRACEPOINT_CATEGORY
            );
        }
        Ok(attached)
    }

    /// Get the perf event array the forwarders write to
    pub fn get_perf_array(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map("EVENTS")
            .context("EVENTS map not found in eBPF object")?;

        AsyncPerfEventArray::try_from(map)
            .context("Failed to create AsyncPerfEventArray from EVENTS map")
    }

    /// Read the kernel-side counters, keyed by name
    pub fn read_stats(&self) -> Result<BTreeMap<&'static str, u64>> {
        let map = self
            .ebpf
            .map("STATS")
            .context("STATS map not found in eBPF object")?;
        let stats: HashMap<_, u32, u64> =
            HashMap::try_from(map).context("Failed to open STATS as HashMap")?;

        let names = [
            (STAT_TOTAL_EVENTS, "total_events"),
            (STAT_TX_ENQUEUE_EVENTS, "tx_enqueue_events"),
            (STAT_TX_COMPLETION_EVENTS, "tx_completion_events"),
            (STAT_RX_COMPLETION_EVENTS, "rx_completion_events"),
            (STAT_RX_DELIVER_EVENTS, "rx_deliver_events"),
            (STAT_READ_ERRORS, "read_errors"),
        ];

        Ok(names
            .into_iter()
            .map(|(id, name)| (name, stats.get(&id, 0).unwrap_or(0)))
            .collect())
    }
}
