//! The injection process.
//!
//! Each device group is injected by a supervised child process (this
//! executable re-invoked with the hidden `injector` subcommand). The
//! parent keeps the child's stdin as the command channel (a single CLOSE
//! byte) and its stdout as the state channel (a single state byte,
//! RUNNING or NO_DEVICES); stdin EOF doubles as CLOSE so a dying parent
//! always tears the injection down.
//!
//! Inside the child a current-thread scheduler drives one forwarder task
//! per grabbed source plus the control-pipe listener. The ungrab pass runs
//! on the main thread after the scheduler has been torn down, so it
//! happens on every exit path.

use crate::capabilities::Capabilities;
use crate::devices::DeviceGroup;
use crate::forward::{self, Forwarder};
use crate::grab;
use crate::mapping::Mappings;
use crate::uinput::{CreateError, SyntheticDevice};
use anyhow::{Context, Result};
use evdev::Device;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::{debug, error, info, warn};

/// Exit code of the injector child when the kernel's uinput interface does
/// not accept input properties.
pub const EXIT_OLD_KERNEL: i32 = 12;

/// The only inbound control message.
const MSG_CLOSE: u8 = 0;

/// Coarse injection state as observed by the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectorState {
    Unknown,
    Starting,
    Failed,
    Running,
    Stopped,
    NoDevices,
}

impl InjectorState {
    /// The numeric code exposed on the control surface.
    pub fn code(self) -> i32 {
        match self {
            InjectorState::Unknown => -1,
            InjectorState::Starting => 2,
            InjectorState::Failed => 3,
            InjectorState::Running => 4,
            InjectorState::Stopped => 5,
            InjectorState::NoDevices => 6,
        }
    }

    /// States the child may report over the pipe.
    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            4 => Some(InjectorState::Running),
            6 => Some(InjectorState::NoDevices),
            _ => None,
        }
    }
}

/// Everything the child needs, serialized into its spawn argument.
#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub group: DeviceGroup,
    pub mappings: Mappings,
}

/// One observation step of the parent-side state machine.
///
/// `pending` is the state message read off the pipe, only consulted while
/// the child has not reported yet.
fn advance(state: InjectorState, alive: bool, pending: Option<InjectorState>) -> InjectorState {
    let mut state = state;

    if state == InjectorState::Unknown {
        // The child process exists as soon as the handle does.
        state = InjectorState::Starting;
    }

    if state == InjectorState::Starting {
        if let Some(reported) = pending {
            state = reported;
        }
    }

    if matches!(state, InjectorState::Starting | InjectorState::Running) && !alive {
        state = InjectorState::Failed;
    }

    state
}

/// Parent-side handle to one injection process.
pub struct Injector {
    group: DeviceGroup,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    state: InjectorState,
}

impl Injector {
    /// Spawn the injection child for a device group with a mapping
    /// snapshot. The snapshot is never re-read after this point.
    pub fn spawn(group: DeviceGroup, mappings: Mappings) -> Result<Self> {
        info!("starting injection for device group \"{}\"", group.key);

        let spec = SpawnSpec {
            group: group.clone(),
            mappings,
        };
        let payload = serde_json::to_string(&spec).context("failed to encode spawn payload")?;

        let exe = std::env::current_exe().context("failed to locate own executable")?;
        let mut command = Command::new(exe);
        command
            .arg("injector")
            .arg(payload)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if tracing::enabled!(tracing::Level::DEBUG) {
            command.arg("--debug");
        }
        let mut child = command.spawn().context("failed to spawn injector process")?;

        let stdin = child.stdin.take().context("injector child has no stdin")?;
        let stdout = child.stdout.take().context("injector child has no stdout")?;
        forward::set_nonblocking_fd(stdout.as_raw_fd())
            .context("failed to unblock injector state pipe")?;

        Ok(Self {
            group,
            child,
            stdin: Some(stdin),
            stdout,
            state: InjectorState::Unknown,
        })
    }

    pub fn group(&self) -> &DeviceGroup {
        &self.group
    }

    /// Current state, refreshed from the child without ever blocking.
    pub fn get_state(&mut self) -> InjectorState {
        let alive = matches!(self.child.try_wait(), Ok(None));

        let pending = if matches!(self.state, InjectorState::Unknown | InjectorState::Starting) {
            self.read_state_message()
        } else {
            None
        };

        let next = advance(self.state, alive, pending);
        if next == InjectorState::Failed && self.state != InjectorState::Failed {
            error!("injector process was unexpectedly found stopped");
        }
        self.state = next;
        self.state
    }

    fn read_state_message(&mut self) -> Option<InjectorState> {
        let mut buf = [0u8; 1];
        loop {
            match self.stdout.read(&mut buf) {
                Ok(0) => return None,
                Ok(_) => match InjectorState::from_wire(buf[0]) {
                    Some(state) => return Some(state),
                    None => warn!("ignoring unexpected state message {}", buf[0]),
                },
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return None,
                Err(err) => {
                    warn!("failed to read injector state: {err}");
                    return None;
                }
            }
        }
    }

    /// Ask the child to shut down. The state is set eagerly; the child
    /// ungrabs its sources on the way out.
    pub fn stop_injecting(&mut self) {
        info!("stopping injector for group \"{}\"", self.group.key);
        if let Some(stdin) = self.stdin.as_mut() {
            if let Err(err) = stdin.write_all(&[MSG_CLOSE]).and_then(|()| stdin.flush()) {
                debug!("failed to send close to injector: {err}");
            }
        }
        self.state = InjectorState::Stopped;
    }
}

impl Drop for Injector {
    fn drop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.write_all(&[MSG_CLOSE]);
            // Dropping stdin delivers EOF even if the byte was lost.
        }
        let _ = self.child.wait();
    }
}

/// Child-process entry point. Returns only after the ungrab pass; a
/// too-old kernel uinput interface terminates the process with
/// [`EXIT_OLD_KERNEL`] instead.
pub fn run_child(payload: &str) -> Result<()> {
    let spec: SpawnSpec =
        serde_json::from_str(payload).context("invalid injector spawn payload")?;
    info!("starting injecting for device \"{}\"", spec.group.key);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build injector scheduler")?;

    let mut sources = Vec::new();
    for path in &spec.group.paths {
        if let Some(source) = grab::grab_source(path, &spec.mappings) {
            sources.push((path.clone(), source));
        }
    }

    if sources.is_empty() {
        error!("did not grab any devices");
        send_state(InjectorState::NoDevices)?;
        return Ok(());
    }

    let mut forwarders = match build_forwarders(sources, &spec.mappings) {
        Ok(forwarders) => forwarders,
        // build_forwarders has already released every grab on this path.
        Err(BuildError::OldKernel(err)) => {
            error!(
                "uinput rejected mirrored input properties ({err}), \
                 please upgrade your kernel"
            );
            std::process::exit(EXIT_OLD_KERNEL);
        }
        Err(BuildError::Fatal(err)) => return Err(err),
    };

    if let Err(err) = send_state(InjectorState::Running) {
        ungrab_all(&mut forwarders);
        return Err(err);
    }

    let group_key = spec.group.key.clone();
    runtime.block_on(async {
        let reads = futures::future::join_all(forwarders.iter_mut().map(Forwarder::run));
        tokio::select! {
            _ = reads => error!("every source read loop stopped"),
            () = control_listener(&group_key) => {}
        }
    });

    info!("ungrabbing all input devices for device group \"{group_key}\"");
    ungrab_all(&mut forwarders);

    Ok(())
}

enum BuildError {
    /// The running kernel's uinput interface rejected the property setup.
    OldKernel(std::io::Error),
    Fatal(anyhow::Error),
}

/// Pair every grabbed source with a freshly created synthetic device.
///
/// On any failure all grabs are released (the pairs built so far, the
/// failing source and the not-yet-paired remainder) before the error is
/// returned, so callers may exit straight away.
fn build_forwarders(
    sources: Vec<(PathBuf, Device)>,
    mappings: &Mappings,
) -> Result<Vec<Forwarder>, BuildError> {
    let mut forwarders = Vec::new();
    let mut pending = sources.into_iter();

    while let Some((path, mut source)) = pending.next() {
        match pair_synthetic(&path, &source) {
            Ok(sink) => {
                forwarders.push(Forwarder::new(source, path, sink, mappings.clone()));
            }
            Err(err) => {
                release_grab(&path, &mut source);
                ungrab_all(&mut forwarders);
                for (path, mut source) in pending.by_ref() {
                    release_grab(&path, &mut source);
                }
                return Err(err);
            }
        }
    }

    Ok(forwarders)
}

fn pair_synthetic(path: &Path, source: &Device) -> Result<SyntheticDevice, BuildError> {
    let caps = Capabilities::from_device(source, true)
        .with_context(|| format!("failed to read capabilities of {}", path.display()))
        .map_err(BuildError::Fatal)?;

    let sink = match SyntheticDevice::create(source, &caps.mirror()) {
        Ok(sink) => sink,
        Err(CreateError::Properties(err)) => return Err(BuildError::OldKernel(err)),
        Err(CreateError::Io(err)) => {
            return Err(BuildError::Fatal(anyhow::Error::new(err).context(format!(
                "failed to create synthetic device for {}",
                path.display()
            ))));
        }
    };

    forward::set_nonblocking(source)
        .with_context(|| format!("failed to unblock {}", path.display()))
        .map_err(BuildError::Fatal)?;

    Ok(sink)
}

/// Release the grab of every pair, swallowing errors from nodes that are
/// already gone.
fn ungrab_all(forwarders: &mut [Forwarder]) {
    for forwarder in forwarders {
        if let Err(err) = forwarder.ungrab() {
            // Ungrabbing a node that was already released errors; the next
            // injection only cares that the grab is gone.
            debug!("ungrab on {}: {err}", forwarder.path().display());
        }
    }
}

fn release_grab(path: &Path, source: &mut Device) {
    if let Err(err) = source.ungrab() {
        debug!("ungrab on {}: {err}", path.display());
    }
}

fn send_state(state: InjectorState) -> Result<()> {
    let mut out = std::io::stdout();
    out.write_all(&[state.code() as u8])
        .and_then(|()| out.flush())
        .context("failed to report state to parent")
}

/// Waits for CLOSE (or EOF, meaning the parent is gone) on stdin.
async fn control_listener(group_key: &str) {
    let stdin = std::io::stdin();
    if let Err(err) = forward::set_nonblocking_fd(stdin.as_raw_fd()) {
        error!("failed to unblock control pipe: {err}");
        return;
    }
    let afd = match AsyncFd::with_interest(stdin, Interest::READABLE) {
        Ok(afd) => afd,
        Err(err) => {
            error!("failed to watch control pipe: {err}");
            return;
        }
    };

    loop {
        let mut guard = match afd.readable().await {
            Ok(guard) => guard,
            Err(err) => {
                error!("failed to wait on control pipe: {err}");
                return;
            }
        };

        let read = guard.try_io(|inner| {
            let mut buf = [0u8; 1];
            inner.get_ref().lock().read(&mut buf).map(|n| (n, buf[0]))
        });

        match read {
            Ok(Ok((0, _))) => {
                debug!("control pipe closed, shutting down injector \"{group_key}\"");
                return;
            }
            Ok(Ok((_, MSG_CLOSE))) => {
                debug!("received close signal at injector \"{group_key}\"");
                return;
            }
            Ok(Ok((_, other))) => warn!("ignoring unknown control message {other}"),
            Ok(Err(err)) => {
                error!("control pipe read failed: {err}");
                return;
            }
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InjectorState::*;
    use super::*;

    #[test]
    fn state_codes_match_the_control_surface() {
        assert_eq!(Unknown.code(), -1);
        assert_eq!(Starting.code(), 2);
        assert_eq!(Failed.code(), 3);
        assert_eq!(Running.code(), 4);
        assert_eq!(Stopped.code(), 5);
        assert_eq!(NoDevices.code(), 6);
    }

    #[test]
    fn wire_messages_cover_child_reports_only() {
        assert_eq!(InjectorState::from_wire(4), Some(Running));
        assert_eq!(InjectorState::from_wire(6), Some(NoDevices));
        assert_eq!(InjectorState::from_wire(0), None);
        assert_eq!(InjectorState::from_wire(3), None);
    }

    #[test]
    fn spawned_child_is_starting_until_it_reports() {
        assert_eq!(advance(Unknown, true, None), Starting);
        assert_eq!(advance(Starting, true, None), Starting);
    }

    #[test]
    fn reported_state_is_adopted() {
        assert_eq!(advance(Starting, true, Some(Running)), Running);
        assert_eq!(advance(Unknown, true, Some(Running)), Running);
        // A child that found nothing reports and exits; the report wins
        // over the exit.
        assert_eq!(advance(Starting, false, Some(NoDevices)), NoDevices);
    }

    #[test]
    fn dying_unannounced_is_a_failure() {
        assert_eq!(advance(Starting, false, None), Failed);
        assert_eq!(advance(Running, false, None), Failed);
    }

    #[test]
    fn terminal_states_stick() {
        for state in [Failed, Stopped, NoDevices] {
            assert_eq!(advance(state, false, None), state);
            assert_eq!(advance(state, true, None), state);
        }
    }

    #[test]
    fn observed_states_are_monotonic() {
        // UNKNOWN -> STARTING -> RUNNING -> FAILED over a child lifetime.
        let mut state = Unknown;
        let steps = [
            (true, None, Starting),
            (true, None, Starting),
            (true, Some(Running), Running),
            (true, None, Running),
            (false, None, Failed),
            (false, None, Failed),
        ];
        for (alive, pending, expected) in steps {
            state = advance(state, alive, pending);
            assert_eq!(state, expected);
        }
    }
}
