//! The 1 Hz logic loop: board snapshots, PMIC reset policy, analog
//! conversions, and the HVAC machine driving the digital outputs.
//!
//! Each iteration resets the watchdog, copies every involved board's state
//! out of its serial worker, applies the overcurrent reset policy,
//! precomputes engineering values for every mapped analog input, snapshots
//! the setpoints, runs the mode machine, and writes any output changes
//! back through the workers. Every tenth iteration the configuration
//! overlay is persisted so tuned setpoints survive a restart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::cache::{AI_COUNT, CacheEntry8, CacheEntry16};
use crate::config::{AiSubtype, BoardPoint, ConfigStore, PointType};
use crate::error::{LogicError, Result};
use crate::hvac::{AI_NO_SIGNAL, HvacMachine, LoopCtx, Outputs};
use crate::registry::{ThreadRegistry, WorkerKind};
use crate::sync::{Guarded, interruptible_sleep};
use crate::watchdog::WatchdogHandle;

/// Sleep between logic iterations (just under a second, like the plant
/// expects; the work itself fills the remainder).
const LOGIC_SLEEP: Duration = Duration::from_millis(999);

/// Iterations between configuration overlay saves.
const CONFIG_SAVE_INTERVAL: u64 = 10;

/// ADC reference voltage.
pub const ADC_VREF_MAX: f64 = 5.0;

/// ADC resolution.
pub const ADC_STEPS: f64 = 4096.0;

/// PMIC bit: analog rail enabled.
pub const PMIC_AI_EN_MASK: u8 = 0x01;
/// PMIC bit: digital rail enabled.
pub const PMIC_DO_EN_MASK: u8 = 0x02;
/// PMIC bit: analog rail fault.
pub const PMIC_AI_ERR_MASK: u8 = 0x04;
/// PMIC bit: digital rail fault.
pub const PMIC_DO_ERR_MASK: u8 = 0x08;

/// Rolling window for the PMIC reset budget.
const PMIC_RESET_WINDOW: Duration = Duration::from_secs(60);

/// Reset writes allowed per board inside one window.
const PMIC_RESET_LIMIT: u32 = 3;

/// Value of one mapped point as the logic layer sees it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointStatus {
    /// A digital output bit.
    Switch(bool),
    /// A calculated analog value.
    Value(f64),
}

impl std::fmt::Display for PointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Switch(v) => write!(f, "{}", u8::from(*v)),
            Self::Value(v) => write!(f, "{v}"),
        }
    }
}

/// Latest state copied out of one board's serial worker.
#[derive(Debug, Clone, Default)]
struct BoardSnapshot {
    do_state: CacheEntry8,
    pmic_state: CacheEntry8,
    ai_state: [CacheEntry16; AI_COUNT],
}

/// Per-board overcurrent reset bookkeeping.
#[derive(Debug)]
struct PmicReset {
    last_reset: Instant,
    count: u32,
    failed: bool,
}

/// Everything the loop mutates, held under one lock.
#[derive(Debug)]
struct LogicState {
    config: ConfigStore,
    iterations: u64,
    involved_boards: Vec<String>,
    boards: BTreeMap<String, BoardSnapshot>,
    calculated_ai: BTreeMap<String, f64>,
    setpoints: BTreeMap<String, f64>,
    pmic_resets: BTreeMap<String, PmicReset>,
    machine: HvacMachine,
    config_save_counter: u64,
}

/// The logic loop and the facade the server dispatch calls into.
pub struct LogicLoop {
    state: Guarded<LogicState>,
    registry: Arc<ThreadRegistry>,
    stop: Arc<AtomicBool>,
}

// ── Analog conversions ──────────────────────────────────────────────

/// Raw ADC counts to volts at the input terminal.
fn raw_to_volts(raw: u16) -> f64 {
    f64::from(raw) * (ADC_VREF_MAX / ADC_STEPS)
}

/// 4-20 mA conversion: terminal volts across the 240 Ω burden resistor,
/// scaled into the configured `[min, max]` range.
pub fn calculate_420_value(volts: f64, min: i64, max: i64) -> f64 {
    let current_ma = (volts / 240.0) * 1000.0;
    let span = (max - min) as f64;
    (span / 16.0) * (current_ma - 4.0) + min as f64
}

/// ICTD conversion: terminal volts (after dividing out the x10 op-amp)
/// across the 1 kΩ sink give µA, and 1 µA is 1 K.
pub fn calculate_ictd_value(volts: f64) -> f64 {
    let microamps = volts * 1000.0;
    microamps - 273.15
}

/// Celsius to Fahrenheit.
pub fn c_to_f(c: f64) -> f64 {
    (c * 9.0 / 5.0) + 32.0
}

/// Engineering value for one mapped analog input.
///
/// Zero volts means no sensor (a 4-20 loop cannot read 0 and an ICTD
/// would be reporting 0 K), reported as the [`AI_NO_SIGNAL`] sentinel.
fn calculate_point_value(point: &BoardPoint, raw: u16) -> f64 {
    let volts = raw_to_volts(raw);

    match &point.ai {
        Some(AiSubtype::CurrentLoop { min, max }) => {
            if volts == 0.0 {
                AI_NO_SIGNAL
            } else {
                calculate_420_value(volts, *min, *max)
            }
        }
        Some(AiSubtype::Ictd { celsius }) => {
            if volts == 0.0 {
                AI_NO_SIGNAL
            } else {
                let c = calculate_ictd_value(volts / 10.0);
                if *celsius { c } else { c_to_f(c) }
            }
        }
        None => AI_NO_SIGNAL,
    }
}

impl LogicLoop {
    /// Builds the loop over a loaded configuration.
    ///
    /// The involved-board list is derived from the configured DO and AI
    /// points, so only boards the logic actually reads get snapshotted.
    pub fn new(config: ConfigStore, registry: Arc<ThreadRegistry>) -> Arc<Self> {
        let mut involved: Vec<String> = Vec::new();
        for point in config.do_points().iter().chain(config.ai_points()) {
            if !involved.contains(&point.board) {
                involved.push(point.board.clone());
            }
        }

        let boards = involved
            .iter()
            .map(|tag| (tag.clone(), BoardSnapshot::default()))
            .collect();

        Arc::new(Self {
            state: Guarded::new(
                "LOGIC_LOOP",
                LogicState {
                    config,
                    iterations: 0,
                    involved_boards: involved,
                    boards,
                    calculated_ai: BTreeMap::new(),
                    setpoints: BTreeMap::new(),
                    pmic_resets: BTreeMap::new(),
                    machine: HvacMachine::new(),
                    config_save_counter: 0,
                },
            ),
            registry,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Starts the loop thread.
    ///
    /// A failure inside `process` is fatal: the loop requests process
    /// shutdown and dies, and the supervisor tears everything down.
    ///
    /// # Errors
    ///
    /// Registry refusal surfaces here.
    pub fn spawn(
        self: &Arc<Self>,
        registry: &ThreadRegistry,
        watchdog: WatchdogHandle,
    ) -> Result<()> {
        let logic = Arc::clone(self);

        registry.launch(
            "LOGIC_LOOP",
            WorkerKind::Logic,
            Arc::clone(&self.stop),
            move |stop| {
                info!("starting logic thread");

                while !stop.load(Ordering::SeqCst) {
                    interruptible_sleep(LOGIC_SLEEP, &stop);
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }

                    watchdog.reset();

                    if let Err(e) = logic.process() {
                        error!("logic iteration failed; aborting: {e}");
                        crate::runtime::request_shutdown();
                        break;
                    }
                }

                info!("logic thread finished");
            },
        )?;

        Ok(())
    }

    /// One full iteration. Public so a test harness can drive the loop
    /// synchronously without the thread.
    ///
    /// # Errors
    ///
    /// Missing setpoints or unknown points are fatal to the iteration and
    /// to the loop.
    pub fn process(&self) -> Result<()> {
        let mut state = self.state.lock(&self.stop)?;
        let state = &mut *state;
        state.iterations += 1;

        // Step 1: copy out board state and apply the PMIC reset policy.
        for tag in state.involved_boards.clone() {
            let worker = match self.registry.serial_worker(&tag) {
                Ok(worker) => worker,
                Err(e) => {
                    // The supervisor may be mid-restart of this worker.
                    warn!(board = %tag, "skipping iteration: {e}");
                    return Ok(());
                }
            };

            let snapshot = worker.snapshot()?;
            let board = BoardSnapshot {
                do_state: snapshot.latest_do(),
                pmic_state: snapshot.latest_pmic(),
                ai_state: snapshot.latest_ai(),
            };
            let pmic_value = board.pmic_state.value;
            state.boards.insert(tag.clone(), board);

            Self::pmic_reset_policy(
                &mut state.pmic_resets,
                &tag,
                pmic_value,
                &worker,
                PMIC_RESET_WINDOW,
            );
        }

        // Step 2: precompute engineering values for mapped analog inputs.
        for (name, point) in state.config.point_map() {
            if point.kind != PointType::Ai {
                continue;
            }
            let Some(board) = state.boards.get(&point.board) else {
                continue;
            };
            let raw = board.ai_state[point.index as usize].value;
            state
                .calculated_ai
                .insert(name.clone(), calculate_point_value(point, raw));
        }

        // Step 3: snapshot the setpoints.
        for (name, sp) in state.config.sp_points() {
            state.setpoints.insert(name.clone(), sp.value);
        }

        // Step 4: run the mode machine and apply its outputs.
        let ctx = Self::build_ctx(&state.setpoints, &state.calculated_ai)?;
        let outputs = state.machine.step(&ctx);
        self.apply_outputs(&state.boards, &state.config, outputs)?;

        // Step 5: persist tuned setpoints periodically.
        state.config_save_counter += 1;
        if state.config_save_counter >= CONFIG_SAVE_INTERVAL {
            state.config.save()?;
            state.config_save_counter = 0;
        }

        Ok(())
    }

    /// Writing the PMIC byte back resets faulted rails. Boards get
    /// [`PMIC_RESET_LIMIT`] writes per rolling window; a board that burns
    /// the budget is marked failed and left alone until the window passes
    /// quietly.
    fn pmic_reset_policy(
        counters: &mut BTreeMap<String, PmicReset>,
        tag: &str,
        pmic_value: u8,
        worker: &crate::serial::SerialWorker,
        window: Duration,
    ) {
        let faulted = pmic_value & (PMIC_AI_ERR_MASK | PMIC_DO_ERR_MASK) != 0;
        let now = Instant::now();

        if !faulted {
            if let Some(entry) = counters.get(tag) {
                if now.duration_since(entry.last_reset) > window {
                    debug!(board = %tag, "removing board from PMIC failure counters");
                    counters.remove(tag);
                }
            }
            return;
        }

        match counters.get_mut(tag) {
            None => {
                info!(board = %tag, "PMIC overcurrent sensed; resetting (1/{PMIC_RESET_LIMIT})");
                counters.insert(
                    tag.to_string(),
                    PmicReset {
                        last_reset: now,
                        count: 1,
                        failed: false,
                    },
                );
                let _ = worker.set_pmic(pmic_value);
            }
            Some(entry) if entry.failed => {
                // Burned its budget; leave the board alone.
            }
            Some(entry) => {
                if now.duration_since(entry.last_reset) > window {
                    // Quiet long enough; the budget starts over.
                    entry.count = 1;
                    entry.last_reset = now;
                    info!(board = %tag, "PMIC overcurrent sensed; resetting (1/{PMIC_RESET_LIMIT})");
                    let _ = worker.set_pmic(pmic_value);
                } else if entry.count < PMIC_RESET_LIMIT {
                    entry.count += 1;
                    info!(
                        board = %tag,
                        "PMIC overcurrent sensed; resetting ({}/{PMIC_RESET_LIMIT})",
                        entry.count
                    );
                    let _ = worker.set_pmic(pmic_value);
                    if entry.count == PMIC_RESET_LIMIT {
                        entry.failed = true;
                        error!(
                            board = %tag,
                            "PMIC failed to reset too many times in a window; giving up on this board"
                        );
                    }
                } else {
                    entry.failed = true;
                }
            }
        }
    }

    /// Assembles the machine's iteration inputs from the snapshots.
    fn build_ctx(
        setpoints: &BTreeMap<String, f64>,
        calculated_ai: &BTreeMap<String, f64>,
    ) -> Result<LoopCtx> {
        let sp = |name: &str| -> Result<f64> {
            setpoints
                .get(name)
                .copied()
                .ok_or_else(|| LogicError::UnknownPoint { name: name.to_string() }.into())
        };
        let ai = |name: &str| -> Result<f64> {
            calculated_ai
                .get(name)
                .copied()
                .ok_or_else(|| LogicError::UnknownPoint { name: name.to_string() }.into())
        };

        // Readings rounded to one decimal place, as the probes deliver.
        let temp = (ai("SPACE_1_TEMP")? * 10.0).trunc() / 10.0;
        let rh = (ai("SPACE_1_RH")? * 10.0).trunc() / 10.0;

        let temp_input_min = sp("_TEMP_INPUT_MIN")?;
        let temp_input_max = sp("_TEMP_INPUT_MAX")?;
        let rh_input_min = sp("_RH_INPUT_MIN")?;
        let rh_input_max = sp("_RH_INPUT_MAX")?;

        Ok(LoopCtx {
            sp_space_temp: sp("SPACE TEMP")?,
            sp_space_rh: sp("SPACE RH")?,
            sp_temp_delta_high: sp("SPACE TEMP DELTA HIGH")?,
            sp_temp_delta_low: sp("SPACE TEMP DELTA LOW")?,
            sp_rh_delta: sp("SPACE RH DELTA")?,
            sp_rh_temp_delta: sp("SPACE RH TEMP DELTA")?,
            pre_delay_cooling: sp("AHU FAN DELAY PRE COOLING")? as u32,
            post_delay_cooling: sp("AHU FAN DELAY POST COOLING")? as u32,
            pre_delay_heating: sp("AHU FAN DELAY PRE HEATING")? as u32,
            post_delay_heating: sp("AHU FAN DELAY POST HEATING")? as u32,
            cooling_sp_delay: sp("COOLING SETPOINT DELAY")? as u32,
            heating_sp_delay: sp("HEATING SETPOINT DELAY")? as u32,
            dehum_sp_delay: sp("DEHUM SETPOINT DELAY")? as u32,
            mode_switch_delay: sp("MODE SWITCH DELAY")? as u32,
            cooling_deadband: sp("COOLING DEADBAND")?,
            heating_deadband: sp("HEATING DEADBAND")?,
            dehum_deadband: sp("DEHUM DEADBAND")?,
            temp_valid: temp != AI_NO_SIGNAL && temp >= temp_input_min && temp <= temp_input_max,
            rh_valid: rh != AI_NO_SIGNAL && rh >= rh_input_min && rh <= rh_input_max,
            temp,
            rh,
        })
    }

    /// Writes output changes through the workers, comparing against the
    /// cached DO bits so unchanged outputs generate no traffic.
    fn apply_outputs(
        &self,
        boards: &BTreeMap<String, BoardSnapshot>,
        config: &ConfigStore,
        outputs: Outputs,
    ) -> Result<()> {
        self.apply_output(boards, config, "AHU_HEATER", outputs.heater)?;
        self.apply_output(boards, config, "AC_COMPRESSOR", outputs.compressor)?;
        self.apply_output(boards, config, "AHU_FAN", outputs.fan)?;
        Ok(())
    }

    fn apply_output(
        &self,
        boards: &BTreeMap<String, BoardSnapshot>,
        config: &ConfigStore,
        name: &str,
        desired: bool,
    ) -> Result<()> {
        let point = config
            .point_map()
            .get(name)
            .ok_or_else(|| LogicError::UnknownPoint { name: name.to_string() })?;

        let Some(board) = boards.get(&point.board) else {
            return Err(LogicError::NoWorker {
                tag: point.board.clone(),
            }
            .into());
        };

        let current = board.do_state.value;
        let mask = 1u8 << point.index;
        let is_set = current & mask != 0;

        if is_set == desired {
            return Ok(());
        }

        debug!(point = %name, on = desired, "switching output");
        let next = if desired { current | mask } else { current & !mask };
        let worker = self.registry.serial_worker(&point.board)?;
        worker.set_do(next)?;
        worker.refresh_do();
        Ok(())
    }

    // ── Facade used by the server dispatch ──────────────────────────────

    /// Updates a setpoint and marks it for the next overlay save.
    ///
    /// # Errors
    ///
    /// Unknown setpoint names and lock failures propagate.
    pub fn set_sp(&self, name: &str, value: f64) -> Result<()> {
        let mut state = self.state.lock(&self.stop)?;
        state.config.set_sp(name, value)
    }

    /// Current value of one setpoint.
    ///
    /// # Errors
    ///
    /// Unknown setpoint names and lock failures propagate.
    pub fn sp_value(&self, name: &str) -> Result<f64> {
        let state = self.state.lock(&self.stop)?;
        state.config.sp_value(name)
    }

    /// Key-to-status of every mapped point, as the logic layer sees it.
    ///
    /// # Errors
    ///
    /// Lock failures propagate.
    pub fn logic_status(&self) -> Result<BTreeMap<String, PointStatus>> {
        let state = self.state.lock(&self.stop)?;
        let mut status = BTreeMap::new();

        for (name, point) in state.config.point_map() {
            match point.kind {
                PointType::Do => {
                    let set = state
                        .boards
                        .get(&point.board)
                        .map(|b| b.do_state.value & (1 << point.index) != 0)
                        .unwrap_or(false);
                    status.insert(name.clone(), PointStatus::Switch(set));
                }
                PointType::Ai => {
                    let value = state.calculated_ai.get(name).copied().unwrap_or(AI_NO_SIGNAL);
                    status.insert(name.clone(), PointStatus::Value(value));
                }
                _ => {
                    error!(point = %name, "unrecognized point type in point map");
                }
            }
        }

        Ok(status)
    }

    /// Rendered labels of the requested configuration kind, for
    /// GET_LABELS replies.
    ///
    /// # Errors
    ///
    /// Lock failures propagate.
    pub fn labels(&self, kind: PointType) -> Result<Vec<String>> {
        let state = self.state.lock(&self.stop)?;
        let config = &state.config;

        let labels = match kind {
            PointType::Do => config.do_points().iter().map(ToString::to_string).collect(),
            PointType::Ai => config.ai_points().iter().map(ToString::to_string).collect(),
            PointType::Sp => config.sp_points().values().map(ToString::to_string).collect(),
            PointType::Map => {
                let mut parts = Vec::new();
                for (name, point) in config.point_map() {
                    parts.push(name.clone());
                    parts.push(point.to_string());
                }
                parts
            }
            PointType::Board => config
                .boards()
                .iter()
                .map(|b| format!("({},{})", b.tag, b.device))
                .collect(),
        };

        Ok(labels)
    }

    /// Number of completed iterations (test and introspection use).
    pub fn iterations(&self) -> u64 {
        self.state
            .lock(&self.stop)
            .map(|state| state.iterations)
            .unwrap_or(0)
    }

    /// Current mode machine posture, for status logging.
    ///
    /// # Errors
    ///
    /// Lock failures propagate.
    pub fn hvac_state(&self) -> Result<(crate::hvac::OperatingState, crate::hvac::OperatingMode)> {
        let state = self.state.lock(&self.stop)?;
        Ok((state.machine.state(), state.machine.mode()))
    }
}

impl std::fmt::Debug for LogicLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicLoop").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_420_conversion() {
        // 4 mA (0.96 V across 240 Ω) is the bottom of the range.
        let volts = 0.96;
        let value = calculate_420_value(volts, 0, 100);
        assert!((value - 0.0).abs() < 1e-9);

        // 20 mA (4.8 V) is the top.
        let value = calculate_420_value(4.8, 0, 100);
        assert!((value - 100.0).abs() < 1e-9);

        // Midpoint: 12 mA -> 50%.
        let value = calculate_420_value(2.88, 0, 100);
        assert!((value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_ictd_conversion() {
        // 0.29815 V at the terminal = 298.15 µA = 298.15 K = 25 °C.
        let c = calculate_ictd_value(0.29815);
        assert!((c - 25.0).abs() < 1e-9);
        assert!((c_to_f(c) - 77.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_volts_is_no_signal() {
        let point = BoardPoint {
            kind: PointType::Ai,
            board: "BOARD1".to_string(),
            index: 0,
            description: "probe".to_string(),
            ai: Some(AiSubtype::CurrentLoop { min: 0, max: 100 }),
        };
        assert_eq!(calculate_point_value(&point, 0), AI_NO_SIGNAL);

        let ictd = BoardPoint {
            ai: Some(AiSubtype::Ictd { celsius: true }),
            ..point
        };
        assert_eq!(calculate_point_value(&ictd, 0), AI_NO_SIGNAL);
    }

    fn worker_fixture(tag: &str) -> std::sync::Arc<crate::serial::SerialWorker> {
        crate::serial::SerialWorker::new(&crate::config::BoardDef {
            tag: tag.to_string(),
            device: "ttyTEST".to_string(),
            debug: false,
        })
    }

    #[test]
    fn test_pmic_reset_budget_and_window() {
        let worker = worker_fixture("BOARD1");
        let mut counters = BTreeMap::new();
        let window = Duration::from_millis(20);
        let faulted = PMIC_AI_ERR_MASK | PMIC_AI_EN_MASK;

        // Three faults inside the window produce three reset writes and
        // flip the board to failed.
        for _ in 0..3 {
            LogicLoop::pmic_reset_policy(&mut counters, "BOARD1", faulted, &worker, window);
        }
        assert_eq!(worker.pending_commands().len(), 3);
        assert!(counters.get("BOARD1").unwrap().failed);

        // A fourth fault in the window writes nothing.
        LogicLoop::pmic_reset_policy(&mut counters, "BOARD1", faulted, &worker, window);
        assert!(worker.pending_commands().is_empty());

        // A quiet window forgets the board entirely.
        std::thread::sleep(Duration::from_millis(30));
        LogicLoop::pmic_reset_policy(&mut counters, "BOARD1", PMIC_AI_EN_MASK, &worker, window);
        assert!(counters.is_empty());

        // And the next fault starts a fresh budget.
        LogicLoop::pmic_reset_policy(&mut counters, "BOARD1", faulted, &worker, window);
        assert_eq!(worker.pending_commands().len(), 1);
        assert!(!counters.get("BOARD1").unwrap().failed);
    }

    const LOOP_CONFIG: &str = "BOARD\tBOARD1\tttyTEST\n\
AI\tBOARD1\t0\tSpace temperature\tICTD\tF\n\
AI\tBOARD1\t1\tSpace humidity\t420\t0\t100\n\
DO\tBOARD1\t0\tAHU fan\n\
DO\tBOARD1\t1\tAC compressor\n\
DO\tBOARD1\t2\tHeater\n\
SP\tSPACE TEMP\t70.0\n\
SP\tSPACE RH\t50.0\n\
SP\tSPACE TEMP DELTA HIGH\t2.0\n\
SP\tSPACE TEMP DELTA LOW\t-2.0\n\
SP\tSPACE RH DELTA\t5.0\n\
SP\tSPACE RH TEMP DELTA\t3.0\n\
SP\tAHU FAN DELAY PRE COOLING\t3\n\
SP\tAHU FAN DELAY POST COOLING\t2\n\
SP\tAHU FAN DELAY PRE HEATING\t3\n\
SP\tAHU FAN DELAY POST HEATING\t2\n\
SP\tCOOLING SETPOINT DELAY\t0\n\
SP\tHEATING SETPOINT DELAY\t0\n\
SP\tDEHUM SETPOINT DELAY\t0\n\
SP\tMODE SWITCH DELAY\t0\n\
SP\tCOOLING DEADBAND\t1.0\n\
SP\tHEATING DEADBAND\t1.0\n\
SP\tDEHUM DEADBAND\t0.0\n\
SP\t_TEMP_INPUT_MIN\t-20.0\n\
SP\t_TEMP_INPUT_MAX\t150.0\n\
SP\t_RH_INPUT_MIN\t0.0\n\
SP\t_RH_INPUT_MAX\t100.0\n\
MAP\tSPACE_1_TEMP\tBOARD1\t0\tAI\n\
MAP\tSPACE_1_RH\tBOARD1\t1\tAI\n\
MAP\tAHU_FAN\tBOARD1\t0\tDO\n\
MAP\tAC_COMPRESSOR\tBOARD1\t1\tDO\n\
MAP\tAHU_HEATER\tBOARD1\t2\tDO\n";

    #[test]
    fn test_full_iteration_drives_heating() {
        use crate::hvac::{OperatingMode, OperatingState};
        use crate::serial::BoardCommand;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configuration.cfg");
        std::fs::write(&path, LOOP_CONFIG).unwrap();

        let registry = Arc::new(crate::registry::ThreadRegistry::new());
        let worker = worker_fixture("BOARD1");
        registry.register_serial(Arc::clone(&worker)).unwrap();

        let logic = LogicLoop::new(ConfigStore::load(&path).unwrap(), Arc::clone(&registry));

        // 2397 counts ≈ 2.926 V ≈ 292.6 µA ≈ 19.45 °C ≈ 67.0 °F.
        worker.force_ai(0, 2397).unwrap();
        // 2045 counts ≈ 10.4 mA ≈ 40 % RH.
        worker.force_ai(1, 2045).unwrap();

        logic.process().unwrap();
        assert_eq!(
            logic.hvac_state().unwrap(),
            (OperatingState::Heating, OperatingMode::DelayOn)
        );

        // The fan pre-roll commanded the fan bit.
        let pending = worker.pending_commands();
        assert!(pending.iter().any(|m| {
            m.bytes.get(3) == Some(&(BoardCommand::SetDoStatus as u8)) && m.bytes.get(4) == Some(&0x01)
        }));

        // The calculated temperature is visible through the status facade.
        let status = logic.logic_status().unwrap();
        match status.get("SPACE_1_TEMP").unwrap() {
            PointStatus::Value(v) => assert!((*v - 67.0).abs() < 0.2),
            other => panic!("unexpected status: {other:?}"),
        }

        // Three more iterations reach Operating with the heater commanded.
        for _ in 0..3 {
            logic.process().unwrap();
        }
        assert_eq!(
            logic.hvac_state().unwrap(),
            (OperatingState::Heating, OperatingMode::Operating)
        );

        let pending = worker.pending_commands();
        assert!(pending.iter().any(|m| {
            m.bytes.get(3) == Some(&(BoardCommand::SetDoStatus as u8))
                && m.bytes.get(4).is_some_and(|bits| bits & 0x04 != 0)
        }));
    }

    #[test]
    fn test_missing_setpoint_is_fatal_to_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configuration.cfg");
        // A sheet with the temperature map but no setpoints at all.
        std::fs::write(
            &path,
            "BOARD\tBOARD1\tttyTEST\n\
AI\tBOARD1\t0\tSpace temperature\tICTD\tC\n\
AI\tBOARD1\t1\tSpace humidity\t420\t0\t100\n\
MAP\tSPACE_1_TEMP\tBOARD1\t0\tAI\n\
MAP\tSPACE_1_RH\tBOARD1\t1\tAI\n",
        )
        .unwrap();

        let registry = Arc::new(crate::registry::ThreadRegistry::new());
        let worker = worker_fixture("BOARD1");
        registry.register_serial(Arc::clone(&worker)).unwrap();

        let logic = LogicLoop::new(ConfigStore::load(&path).unwrap(), Arc::clone(&registry));
        assert!(logic.process().is_err());
    }

    #[test]
    fn test_ictd_point_value_with_opamp_gain() {
        let point = BoardPoint {
            kind: PointType::Ai,
            board: "BOARD1".to_string(),
            index: 0,
            description: "probe".to_string(),
            ai: Some(AiSubtype::Ictd { celsius: true }),
        };

        // Choose a raw count and verify the full chain: counts -> volts ->
        // /10 gain -> µA -> °C.
        let raw = 2442u16; // ~2.981 V at the ADC, ~0.2981 V at the terminal
        let volts = raw_to_volts(raw);
        let expected = calculate_ictd_value(volts / 10.0);
        assert_eq!(calculate_point_value(&point, raw), expected);
        assert!(expected > 20.0 && expected < 30.0);
    }
}
