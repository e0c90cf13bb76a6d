//! Procedure execution.
//!
//! The engine owns the sampling loop and issues every setpoint. It is single
//! threaded: each send, read and sample completes before the next begins.
//! The only suspension points are the link's byte spacing and read timeout,
//! and the wait between samples.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use fugit::SecsDurationU32;
use tracing::{error, info, warn};

use crate::{
    clock::{Clock, Duration, Instant, ZERO, saturating_since},
    error::{Error, Result},
    link::{DeviceLink, Transport},
    packet::{Axis, Command},
    recipe::{ConfigError, Instruction, Procedure, RampPlan},
    sampler::{StatusSampler, query_heating, query_status},
    telemetry::{LiveDisplay, TelemetrySink},
};

/// Tunables for a procedure run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Length of one ramp step when the recipe line does not give a step count.
    pub step_size: SecsDurationU32,
    /// Time between samples while an instruction is held.
    pub sample_period: Duration,
    /// Time between samples in [`ProcedureEngine::monitor`].
    pub monitor_period: Duration,
    /// Resend the temperature setpoint when heating is found off.
    pub heating_interlock: bool,
    /// Extra attempts for the status queries that steer a ramp or the interlock.
    pub query_retries: u8,
    /// Consecutive failed samples tolerated before giving up.
    pub max_missed_samples: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_size: SecsDurationU32::secs(10),
            sample_period: Duration::millis(1_000),
            monitor_period: Duration::millis(500),
            heating_interlock: true,
            query_retries: 3,
            max_missed_samples: 5,
        }
    }
}

impl EngineConfig {
    pub fn with_step_size(mut self, step_size: SecsDurationU32) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_sample_period(mut self, period: Duration) -> Self {
        self.sample_period = period;
        self
    }

    pub fn with_monitor_period(mut self, period: Duration) -> Self {
        self.monitor_period = period;
        self
    }

    pub fn with_heating_interlock(mut self, enabled: bool) -> Self {
        self.heating_interlock = enabled;
        self
    }

    pub fn with_query_retries(mut self, retries: u8) -> Self {
        self.query_retries = retries;
        self
    }

    pub fn with_max_missed_samples(mut self, missed: u8) -> Self {
        self.max_missed_samples = missed;
        self
    }

    pub fn validate(&self) -> core::result::Result<(), ConfigError> {
        if self.step_size.to_secs() == 0 {
            return Err(ConfigError::ZeroStepSize);
        }
        if self.sample_period == ZERO || self.monitor_period == ZERO {
            return Err(ConfigError::ZeroSamplePeriod);
        }
        Ok(())
    }
}

/// Lets another thread stop a run between protocol operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every instruction ran to the end.
    Completed { samples: usize },
    /// Stopped by a [`CancelToken`] during instruction `instruction` (0-based).
    Cancelled { instruction: usize, samples: usize },
}

enum Flow {
    Continue,
    Cancelled,
}

/// Runs procedures against a [`DeviceLink`].
pub struct ProcedureEngine<K: TelemetrySink, D: LiveDisplay> {
    config: EngineConfig,
    sampler: StatusSampler<K, D>,
    /// Last temperature setpoint sent, resent by the interlock.
    last_temperature: Option<Command>,
    missed_samples: u8,
}

impl<K: TelemetrySink, D: LiveDisplay> ProcedureEngine<K, D> {
    pub fn new(config: EngineConfig, sink: K, display: D) -> Self {
        Self {
            config,
            sampler: StatusSampler::new(Instant::from_ticks(0), sink, display),
            last_temperature: None,
            missed_samples: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sampler(&self) -> &StatusSampler<K, D> {
        &self.sampler
    }

    pub fn into_sink(self) -> K {
        self.sampler.into_sink()
    }

    /// Execute `procedure` to completion or cancellation.
    ///
    /// The procedure is validated against the configured step size before
    /// anything is sent. On the first unrecoverable error the last known
    /// sample is logged, the sink is flushed and the error is returned.
    pub fn run<S, C>(
        &mut self,
        link: &mut DeviceLink<S, C>,
        procedure: &Procedure,
        cancel: &CancelToken,
    ) -> Result<Outcome, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        self.config.validate()?;
        procedure.validate(self.config.step_size)?;

        self.sampler.restart(link.now());
        self.last_temperature = None;
        self.missed_samples = 0;
        info!(
            instructions = procedure.instructions().len(),
            seconds = procedure.total_duration().to_secs(),
            "Starting procedure"
        );

        let result = self.run_instructions(link, procedure, cancel);
        self.finish(result)
    }

    /// Sample every [`EngineConfig::monitor_period`] until cancelled, without
    /// sending any setpoint.
    pub fn monitor<S, C>(
        &mut self,
        link: &mut DeviceLink<S, C>,
        cancel: &CancelToken,
    ) -> Result<usize, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        self.config.validate()?;
        self.sampler.restart(link.now());
        self.missed_samples = 0;
        info!("Monitoring");

        let result = self.monitor_loop(link, cancel);
        self.finish(result).map(|_| self.sampler.taken())
    }

    fn monitor_loop<S, C>(
        &mut self,
        link: &mut DeviceLink<S, C>,
        cancel: &CancelToken,
    ) -> Result<Outcome, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        let period = self.config.monitor_period;
        while !cancel.is_cancelled() {
            let tick = link.now();
            self.sample_tolerant(link)?;
            let wait = period
                .checked_sub(saturating_since(link.now(), tick))
                .unwrap_or(ZERO);
            link.delay(wait);
        }
        Ok(Outcome::Cancelled {
            instruction: 0,
            samples: self.sampler.taken(),
        })
    }

    fn finish<I: embedded_io::Error>(
        &mut self,
        result: Result<Outcome, I>,
    ) -> Result<Outcome, I> {
        let flushed = self.sampler.flush();
        match result {
            Ok(outcome) => {
                info!(?outcome, "Procedure finished");
                flushed.map_err(Error::Log)?;
                Ok(outcome)
            }
            Err(err) => {
                match self.sampler.last() {
                    Some(last) => error!(%err, "Procedure aborted, last state: {last}"),
                    None => error!(%err, "Procedure aborted before any sample"),
                }
                if let Err(flush_err) = flushed {
                    warn!(%flush_err, "Could not flush telemetry");
                }
                Err(err)
            }
        }
    }

    fn run_instructions<S, C>(
        &mut self,
        link: &mut DeviceLink<S, C>,
        procedure: &Procedure,
        cancel: &CancelToken,
    ) -> Result<Outcome, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        for (index, instruction) in procedure.instructions().iter().enumerate() {
            info!(index, %instruction, "Instruction");
            let flow = match *instruction {
                Instruction::Hold { duration, command } => {
                    self.hold(link, command, seconds(duration), cancel)?
                }
                Instruction::Ramp { axis, target, .. } => {
                    // Validated above, so a ramp always has a plan.
                    let Some(plan) = instruction.ramp_plan(self.config.step_size)? else {
                        continue;
                    };
                    self.ramp(link, axis, target, plan, cancel)?
                }
            };
            if let Flow::Cancelled = flow {
                info!(index, "Procedure cancelled");
                return Ok(Outcome::Cancelled {
                    instruction: index,
                    samples: self.sampler.taken(),
                });
            }
        }
        Ok(Outcome::Completed {
            samples: self.sampler.taken(),
        })
    }

    /// Apply `command`, then sample until `duration` has passed since the call.
    fn hold<S, C>(
        &mut self,
        link: &mut DeviceLink<S, C>,
        command: Command,
        duration: Duration,
        cancel: &CancelToken,
    ) -> Result<Flow, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        let started = link.now();
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        self.apply(link, command)?;
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        self.check_heating_on(link)?;
        self.poll_until(link, started + duration, cancel)
    }

    /// Step `axis` from the device's current setpoint to `target`.
    fn ramp<S, C>(
        &mut self,
        link: &mut DeviceLink<S, C>,
        axis: Axis,
        target: u16,
        plan: RampPlan,
        cancel: &CancelToken,
    ) -> Result<Flow, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        let start = self.retry(link, query_status)?.setpoint(axis);
        info!(%axis, start, target, steps = plan.steps, "Ramp");

        for k in 1..=plan.steps {
            let command = Command::new(axis, plan.value_at(start, target, k))?;
            if let Flow::Cancelled = self.hold(link, command, seconds(plan.step), cancel)? {
                return Ok(Flow::Cancelled);
            }
        }
        Ok(Flow::Continue)
    }

    fn apply<S, C>(&mut self, link: &mut DeviceLink<S, C>, command: Command) -> Result<(), S::Error>
    where
        S: Transport,
        C: Clock,
    {
        link.command(&command)?;
        if command.axis() == Axis::Temperature {
            self.last_temperature = Some(command);
        }
        Ok(())
    }

    /// Resend the temperature setpoint if the heating relay is off while
    /// a non-zero temperature is commanded.
    fn check_heating_on<S, C>(&mut self, link: &mut DeviceLink<S, C>) -> Result<(), S::Error>
    where
        S: Transport,
        C: Clock,
    {
        if !self.config.heating_interlock {
            return Ok(());
        }
        let heating_on = self.retry(link, query_heating)?;
        match self.last_temperature {
            Some(command) if !heating_on && command.target() > 0 => {
                warn!(%command, "Heating is off, resending temperature");
                link.command(&command)
            }
            _ => Ok(()),
        }
    }

    /// Sample once per [`EngineConfig::sample_period`] until `deadline`.
    fn poll_until<S, C>(
        &mut self,
        link: &mut DeviceLink<S, C>,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Flow, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        let mut next_tick = link.now();
        loop {
            if cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            if link.now() >= deadline {
                return Ok(Flow::Continue);
            }

            self.sample_tolerant(link)?;

            next_tick = next_tick + self.config.sample_period;
            let wake = if next_tick < deadline { next_tick } else { deadline };
            link.delay(saturating_since(wake, link.now()));
        }
    }

    /// Take a sample, treating a short reply as a gap in the log.
    fn sample_tolerant<S, C>(&mut self, link: &mut DeviceLink<S, C>) -> Result<(), S::Error>
    where
        S: Transport,
        C: Clock,
    {
        match self.sampler.sample(link) {
            Ok(_) => {
                self.missed_samples = 0;
                Ok(())
            }
            Err(err) if err.is_recoverable() => {
                self.missed_samples = self.missed_samples.saturating_add(1);
                warn!(%err, missed = self.missed_samples, "Sample lost");
                if self.missed_samples > self.config.max_missed_samples {
                    return Err(err);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Re-issue a query while it times out, up to [`EngineConfig::query_retries`] extra attempts.
    fn retry<S, C, T>(
        &self,
        link: &mut DeviceLink<S, C>,
        query: fn(&mut DeviceLink<S, C>) -> Result<T, S::Error>,
    ) -> Result<T, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        let mut attempt = 0;
        loop {
            match query(link) {
                Err(err) if err.is_recoverable() && attempt < self.config.query_retries => {
                    attempt += 1;
                    warn!(%err, attempt, "Query failed, retrying");
                }
                result => return result,
            }
        }
    }
}

fn seconds(duration: SecsDurationU32) -> Duration {
    Duration::secs(u64::from(duration.to_secs()))
}
