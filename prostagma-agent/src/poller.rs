use std::{path::PathBuf, time::Duration};

use tracing::{error, info, warn};

use crate::{
    client::CoordinatorClient,
    logging::{category_build, category_trigger, outcome_label},
    script::{BuildScript, ScriptError, run_build_script},
    watch::{PollOutcome, TriggerWatch},
};

const MIN_POLL_INTERVAL_MS: u64 = 100;
const MAX_POLL_INTERVAL_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub coordinator_url: String,
    pub secret: String,
    pub trigger: String,
    pub script_path: PathBuf,
    pub shell: String,
    pub poll_interval_ms: u64,
    pub rpc_timeout_ms: u64,
}

/// One build agent: a trigger watch plus the script it runs on every rising
/// edge.
///
/// Everything happens on the caller's task, so a build always finishes before
/// the next sample is taken and two builds never overlap.
pub struct Agent {
    config: AgentConfig,
    client: CoordinatorClient,
    watch: TriggerWatch,
    builds_started: u64,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let client = CoordinatorClient::new(
            &config.coordinator_url,
            config.secret.clone(),
            Duration::from_millis(config.rpc_timeout_ms),
        );
        Self {
            config,
            client,
            watch: TriggerWatch::new(),
            builds_started: 0,
        }
    }

    pub fn client(&self) -> &CoordinatorClient {
        &self.client
    }

    pub fn last_seen(&self) -> u64 {
        self.watch.last_seen()
    }

    pub fn builds_started(&self) -> u64 {
        self.builds_started
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(sanitize_interval(self.config.poll_interval_ms))
    }

    /// Takes the baseline sample. A failure leaves the baseline at zero.
    pub async fn prime(&mut self) {
        match self.client.trigger_count(&self.config.trigger).await {
            Ok(sample) => {
                self.watch.prime(&sample);
                info!(
                    "{} baseline trigger={} count={}",
                    category_trigger(),
                    self.config.trigger,
                    sample.count
                );
            }
            Err(err) => {
                warn!(
                    "{} baseline sample failed trigger={}: {err}",
                    category_trigger(),
                    self.config.trigger
                );
            }
        }
    }

    /// Samples the trigger once and builds if it went up.
    ///
    /// Returns `None` when the coordinator could not be sampled; the previous
    /// count is kept and the next call simply tries again.
    pub async fn poll_once(&mut self) -> Option<PollOutcome> {
        let sample = match self.client.trigger_count(&self.config.trigger).await {
            Ok(sample) => sample,
            Err(err) => {
                warn!(
                    "{} poll failed trigger={}: {err}",
                    category_trigger(),
                    self.config.trigger
                );
                return None;
            }
        };

        let outcome = self.watch.observe(&sample);
        match &outcome {
            PollOutcome::Unchanged => {}
            PollOutcome::Increased { from, to } => {
                info!(
                    "{} triggered trigger={} from={from} to={to}",
                    category_trigger(),
                    self.config.trigger
                );
                let result = self.run_build().await;
                if let Err(err) = result {
                    error!("{} build aborted: {err}", category_build());
                }
            }
            PollOutcome::Decreased { from, to } | PollOutcome::Restarted { from, to } => {
                warn!(
                    "{} coordinator appears to have restarted trigger={} from={from} to={to}; not building",
                    category_trigger(),
                    self.config.trigger
                );
            }
        }
        Some(outcome)
    }

    /// Loads the script fresh from disk and runs it to completion or first
    /// failure.
    pub async fn run_build(&mut self) -> Result<(), ScriptError> {
        self.builds_started += 1;
        let script = BuildScript::load(&self.config.script_path).await?;
        info!(
            "{} running {} steps from {}",
            category_build(),
            script.steps.len(),
            self.config.script_path.display()
        );
        let result = run_build_script(&script, &self.client, &self.config.shell).await;
        info!(
            "{} build finished {}",
            category_build(),
            outcome_label(result.is_ok())
        );
        result
    }
}

pub fn spawn_agent(config: AgentConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_agent(config).await;
    })
}

pub async fn run_agent(config: AgentConfig) {
    let mut agent = Agent::new(config);
    let sleep_for = agent.poll_interval();

    info!(
        "{} agent watching trigger={} coordinator={} every {}ms",
        category_trigger(),
        agent.config.trigger,
        agent.client.base_url(),
        sleep_for.as_millis()
    );

    agent.prime().await;
    loop {
        tokio::time::sleep(sleep_for).await;
        agent.poll_once().await;
    }
}

fn sanitize_interval(value: u64) -> u64 {
    value.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS)
}
