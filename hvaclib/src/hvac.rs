//! The HVAC mode machine: heating, cooling, and dehumidification.
//!
//! One state skeleton drives all three demands. Per-state behavior is
//! supplied by a table of decider functions: an action decider (should
//! the demand be active), a delay decider (how long the fan pre/post
//! rolls), and an output setter (which equipment a mode energizes). The
//! skeleton itself never branches on the demand kind. Deadbands stop
//! oscillation around a setpoint and the mode switch delay stops
//! short-cycling between heating and cooling.
//!
//! The machine is pure with respect to I/O: [`HvacMachine::step`] consumes
//! one iteration's inputs and returns the desired equipment states; the
//! logic loop turns those into DO writes.

use tracing::{debug, error, info};

/// Iterations a required analog input may read invalid before the machine
/// fails safe.
pub const AI_FAILURE_LIMIT: u32 = 5;

/// Sentinel reported for an analog input with no signal behind it.
pub const AI_NO_SIGNAL: f64 = f32::MIN_POSITIVE as f64;

/// Top-level demand the plant is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingState {
    /// Idle.
    #[default]
    None,
    /// Raising space temperature.
    Heating,
    /// Lowering space temperature.
    Cooling,
    /// Lowering space humidity via the cooling path.
    Dehumidifying,
}

/// Phase within a non-idle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperatingMode {
    /// Idle.
    #[default]
    None,
    /// Fan pre-roll before equipment energizes.
    DelayOn,
    /// Equipment energized.
    Operating,
    /// Fan post-roll after equipment de-energizes.
    DelayOff,
}

/// Desired equipment states for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outputs {
    /// AHU_HEATER.
    pub heater: bool,
    /// AC_COMPRESSOR.
    pub compressor: bool,
    /// AHU_FAN.
    pub fan: bool,
}

impl Outputs {
    const ALL_OFF: Self = Self {
        heater: false,
        compressor: false,
        fan: false,
    };

    const FAN_ONLY: Self = Self {
        heater: false,
        compressor: false,
        fan: true,
    };
}

/// One iteration's inputs: setpoints, deltas, delays, and the space
/// readings with their validity already judged against the input windows.
#[derive(Debug, Clone, Default)]
pub struct LoopCtx {
    /// SPACE TEMP.
    pub sp_space_temp: f64,
    /// SPACE RH.
    pub sp_space_rh: f64,
    /// SPACE TEMP DELTA HIGH (cooling engages above setpoint + this).
    pub sp_temp_delta_high: f64,
    /// SPACE TEMP DELTA LOW (heating engages below setpoint + this).
    pub sp_temp_delta_low: f64,
    /// SPACE RH DELTA.
    pub sp_rh_delta: f64,
    /// SPACE RH TEMP DELTA (dehumidification temperature floor offset).
    pub sp_rh_temp_delta: f64,

    /// AHU FAN DELAY PRE COOLING, in iterations.
    pub pre_delay_cooling: u32,
    /// AHU FAN DELAY POST COOLING.
    pub post_delay_cooling: u32,
    /// AHU FAN DELAY PRE HEATING.
    pub pre_delay_heating: u32,
    /// AHU FAN DELAY POST HEATING.
    pub post_delay_heating: u32,

    /// COOLING SETPOINT DELAY: iterations the demand must hold first.
    pub cooling_sp_delay: u32,
    /// HEATING SETPOINT DELAY.
    pub heating_sp_delay: u32,
    /// DEHUM SETPOINT DELAY.
    pub dehum_sp_delay: u32,
    /// MODE SWITCH DELAY between heating and cooling.
    pub mode_switch_delay: u32,

    /// COOLING DEADBAND.
    pub cooling_deadband: f64,
    /// HEATING DEADBAND.
    pub heating_deadband: f64,
    /// DEHUM DEADBAND.
    pub dehum_deadband: f64,

    /// Space temperature reading.
    pub temp: f64,
    /// Space relative humidity reading.
    pub rh: f64,
    /// Whether the temperature reading is usable this iteration.
    pub temp_valid: bool,
    /// Whether the humidity reading is usable this iteration.
    pub rh_valid: bool,
}

impl LoopCtx {
    fn heating_on_point(&self) -> f64 {
        self.sp_space_temp + self.sp_temp_delta_low
    }

    fn heating_off_point(&self) -> f64 {
        self.sp_space_temp + self.sp_temp_delta_low + self.heating_deadband
    }

    fn cooling_on_point(&self) -> f64 {
        self.sp_space_temp + self.sp_temp_delta_high
    }

    fn cooling_off_point(&self) -> f64 {
        self.sp_space_temp + self.sp_temp_delta_high - self.cooling_deadband
    }

    fn dehum_on_point(&self) -> f64 {
        self.sp_space_rh + self.sp_rh_delta
    }

    fn dehum_min_temp(&self) -> f64 {
        self.sp_space_temp - self.sp_rh_temp_delta
    }
}

/// Should the demand be (or stay) active.
type ActionDecider = fn(&LoopCtx) -> bool;

/// Pre/post fan roll lengths for a demand.
type DelayDecider = fn(&LoopCtx) -> (u32, u32);

/// Equipment energized by a demand in a given mode.
type OutputSetter = fn(OperatingMode) -> Outputs;

/// The per-demand function table the state skeleton runs.
struct DemandTable {
    action_on: ActionDecider,
    action_off: ActionDecider,
    delays: DelayDecider,
    outputs: OutputSetter,
}

fn cooling_action_on(ctx: &LoopCtx) -> bool {
    ctx.temp >= ctx.cooling_on_point()
}

fn cooling_action_off(ctx: &LoopCtx) -> bool {
    ctx.temp <= ctx.cooling_off_point()
}

fn heating_action_on(ctx: &LoopCtx) -> bool {
    ctx.temp <= ctx.heating_on_point()
}

fn heating_action_off(ctx: &LoopCtx) -> bool {
    ctx.temp >= ctx.heating_off_point()
}

fn dehum_action_on(ctx: &LoopCtx) -> bool {
    ctx.rh_valid && ctx.rh >= ctx.dehum_on_point() && ctx.temp > ctx.dehum_min_temp()
}

fn dehum_action_off(ctx: &LoopCtx) -> bool {
    !ctx.rh_valid || ctx.rh <= ctx.sp_space_rh - ctx.dehum_deadband.max(0.0)
        || ctx.temp <= ctx.dehum_min_temp()
}

fn cooling_delays(ctx: &LoopCtx) -> (u32, u32) {
    (ctx.pre_delay_cooling, ctx.post_delay_cooling)
}

fn heating_delays(ctx: &LoopCtx) -> (u32, u32) {
    (ctx.pre_delay_heating, ctx.post_delay_heating)
}

fn cooling_outputs(mode: OperatingMode) -> Outputs {
    match mode {
        OperatingMode::Operating => Outputs {
            heater: false,
            compressor: true,
            fan: true,
        },
        OperatingMode::DelayOn | OperatingMode::DelayOff => Outputs::FAN_ONLY,
        OperatingMode::None => Outputs::ALL_OFF,
    }
}

fn heating_outputs(mode: OperatingMode) -> Outputs {
    match mode {
        OperatingMode::Operating => Outputs {
            heater: true,
            compressor: false,
            fan: true,
        },
        OperatingMode::DelayOn | OperatingMode::DelayOff => Outputs::FAN_ONLY,
        OperatingMode::None => Outputs::ALL_OFF,
    }
}

fn demand_table(state: OperatingState) -> Option<DemandTable> {
    match state {
        OperatingState::None => None,
        OperatingState::Heating => Some(DemandTable {
            action_on: heating_action_on,
            action_off: heating_action_off,
            delays: heating_delays,
            outputs: heating_outputs,
        }),
        OperatingState::Cooling => Some(DemandTable {
            action_on: cooling_action_on,
            action_off: cooling_action_off,
            delays: cooling_delays,
            outputs: cooling_outputs,
        }),
        // Dehumidification drives the cooling equipment with its own
        // action deciders.
        OperatingState::Dehumidifying => Some(DemandTable {
            action_on: dehum_action_on,
            action_off: dehum_action_off,
            delays: cooling_delays,
            outputs: cooling_outputs,
        }),
    }
}

/// The mode machine state carried across iterations.
#[derive(Debug, Default)]
pub struct HvacMachine {
    state: OperatingState,
    mode: OperatingMode,
    mode_clicks: u32,
    /// Iterations since a heating or cooling cycle last ended.
    switch_clicks: u32,
    /// The last heating-or-cooling state, for the mode switch gate.
    last_thermal_state: OperatingState,
    heat_pending: u32,
    cool_pending: u32,
    dehum_pending: u32,
    ai_failure_clicks: u32,
    in_ai_failure: bool,
}

impl HvacMachine {
    /// A machine in the idle state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current top-level state.
    pub fn state(&self) -> OperatingState {
        self.state
    }

    /// Current mode within the state.
    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Whether a required analog input has failed the machine safe.
    pub fn in_ai_failure(&self) -> bool {
        self.in_ai_failure
    }

    /// Advances one iteration and returns the desired equipment states.
    pub fn step(&mut self, ctx: &LoopCtx) -> Outputs {
        self.switch_clicks = self.switch_clicks.saturating_add(1);

        if !self.judge_ai(ctx) {
            return Outputs::ALL_OFF;
        }

        match demand_table(self.state) {
            None => self.step_idle(ctx),
            Some(table) => self.step_demand(ctx, &table),
        }
    }

    /// Tracks analog input health; returns false while failed safe.
    fn judge_ai(&mut self, ctx: &LoopCtx) -> bool {
        if ctx.temp_valid {
            if self.in_ai_failure {
                info!("space temperature reading recovered; resuming control");
            }
            self.ai_failure_clicks = 0;
            self.in_ai_failure = false;
            return true;
        }

        self.ai_failure_clicks = self.ai_failure_clicks.saturating_add(1);

        if self.ai_failure_clicks > AI_FAILURE_LIMIT && !self.in_ai_failure {
            error!("space temperature invalid too long; forcing all outputs off");
            self.in_ai_failure = true;
            self.enter_idle();
        }

        // Ride out a short glitch in the current posture.
        !self.in_ai_failure
    }

    fn enter_idle(&mut self) {
        if matches!(
            self.state,
            OperatingState::Heating | OperatingState::Cooling
        ) {
            self.last_thermal_state = self.state;
            self.switch_clicks = 0;
        }
        self.state = OperatingState::None;
        self.mode = OperatingMode::None;
        self.mode_clicks = 0;
        self.heat_pending = 0;
        self.cool_pending = 0;
        self.dehum_pending = 0;
    }

    /// Idle: watch the action deciders, honoring the setpoint delays and
    /// the heating/cooling switch gate.
    fn step_idle(&mut self, ctx: &LoopCtx) -> Outputs {
        self.cool_pending = if cooling_action_on(ctx) {
            self.cool_pending.saturating_add(1)
        } else {
            0
        };
        self.heat_pending = if heating_action_on(ctx) {
            self.heat_pending.saturating_add(1)
        } else {
            0
        };
        self.dehum_pending = if dehum_action_on(ctx) {
            self.dehum_pending.saturating_add(1)
        } else {
            0
        };

        let switch_open = self.switch_clicks >= ctx.mode_switch_delay;

        if self.cool_pending > ctx.cooling_sp_delay
            && (self.last_thermal_state != OperatingState::Heating || switch_open)
        {
            debug!(temp = ctx.temp, point = ctx.cooling_on_point(), "engaging cooling");
            self.engage(OperatingState::Cooling, ctx);
        } else if self.heat_pending > ctx.heating_sp_delay
            && (self.last_thermal_state != OperatingState::Cooling || switch_open)
        {
            debug!(temp = ctx.temp, point = ctx.heating_on_point(), "engaging heating");
            self.engage(OperatingState::Heating, ctx);
        } else if self.dehum_pending > ctx.dehum_sp_delay {
            debug!(rh = ctx.rh, point = ctx.dehum_on_point(), "engaging dehumidification");
            self.engage(OperatingState::Dehumidifying, ctx);
        } else {
            return Outputs::ALL_OFF;
        }

        // First iteration of the new state.
        let table = demand_table(self.state).expect("engaged state has a table");
        (table.outputs)(self.mode)
    }

    fn engage(&mut self, state: OperatingState, ctx: &LoopCtx) {
        self.state = state;
        self.mode_clicks = 0;
        self.heat_pending = 0;
        self.cool_pending = 0;
        self.dehum_pending = 0;

        let table = demand_table(state).expect("engaged state has a table");
        let (pre, _post) = (table.delays)(ctx);
        self.mode = if pre == 0 {
            OperatingMode::Operating
        } else {
            OperatingMode::DelayOn
        };
    }

    /// Runs the state skeleton for an active demand.
    fn step_demand(&mut self, ctx: &LoopCtx, table: &DemandTable) -> Outputs {
        let (pre_delay, post_delay) = (table.delays)(ctx);

        match self.mode {
            OperatingMode::None => {
                // Should not happen; repair to idle.
                self.enter_idle();
                Outputs::ALL_OFF
            }
            OperatingMode::DelayOn => {
                if (table.action_off)(ctx) {
                    // Demand cleared during pre-roll; skip the equipment.
                    self.mode = OperatingMode::DelayOff;
                    self.mode_clicks = 0;
                    return (table.outputs)(self.mode);
                }

                self.mode_clicks += 1;
                if self.mode_clicks >= pre_delay {
                    debug!(state = ?self.state, "fan pre-roll complete; operating");
                    self.mode = OperatingMode::Operating;
                }
                (table.outputs)(self.mode)
            }
            OperatingMode::Operating => {
                if (table.action_off)(ctx) {
                    debug!(state = ?self.state, "demand satisfied; fan post-roll");
                    self.mode = OperatingMode::DelayOff;
                    self.mode_clicks = 0;
                    if post_delay == 0 {
                        self.enter_idle();
                        return Outputs::ALL_OFF;
                    }
                }
                (table.outputs)(self.mode)
            }
            OperatingMode::DelayOff => {
                self.mode_clicks += 1;
                if self.mode_clicks >= post_delay {
                    debug!(state = ?self.state, "fan post-roll complete; idle");
                    self.enter_idle();
                    return Outputs::ALL_OFF;
                }
                (table.outputs)(self.mode)
            }
        }
    }
}
