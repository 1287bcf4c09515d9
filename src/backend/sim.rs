use std::fmt;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{Level, Log, Record};
use nix::errno::Errno;
use nix::poll::PollFlags;
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;

use crate::config::{Direction, EdgeDetect};
use crate::error::GpioError;
use crate::gpio::{Claim, EdgeSource, GpioPin, Lifecycle, Wake};
use crate::monitor::{Canceller, wait_ready};

/// A virtual GPIO line for exercising application logic without hardware.
///
/// Clones share the same line. An output pin can be wired to input pins;
/// driving it sets every wired input to the same state. The wiring holds weak
/// references, so it never keeps a target alive.
#[derive(Clone)]
pub struct SimPin {
    node: Arc<SimNode>,
}

struct SimNode {
    name: String,
    logger: Option<Arc<dyn Log>>,
    monitored: AtomicBool,
    state: Mutex<NodeState>,
}

struct NodeState {
    direction: Direction,
    edge: EdgeDetect,
    value: bool,
    links: Lifecycle<Links>,
}

#[derive(Default)]
struct Links {
    wired: Vec<Weak<SimNode>>,
    // raised on matching edges, cleared by reads
    ready: Option<Arc<EventFd>>,
}

impl SimNode {
    fn log(&self, direction: Direction, args: fmt::Arguments<'_>) {
        if let Some(logger) = &self.logger {
            logger.log(
                &Record::builder()
                    .level(Level::Debug)
                    .target(module_path!())
                    .args(format_args!("{}({}): {}", self.name, direction, args))
                    .build(),
            );
        }
    }
}

impl SimPin {
    pub fn new(number: u32, direction: Direction) -> Self {
        Self::named(format!("SimPin({number})"), direction, None)
    }

    /// A pin with an explicit name and an optional logger that receives a
    /// record for every state change and rewiring.
    pub fn named(
        name: impl Into<String>,
        direction: Direction,
        logger: Option<Arc<dyn Log>>,
    ) -> Self {
        Self {
            node: Arc::new(SimNode {
                name: name.into(),
                logger,
                monitored: AtomicBool::new(false),
                state: Mutex::new(NodeState {
                    direction,
                    edge: EdgeDetect::None,
                    value: false,
                    links: Lifecycle::Open(Links::default()),
                }),
            }),
        }
    }

    /// Last state of the pin. Never fails, also after close.
    pub fn get_state(&self) -> bool {
        self.node.state.lock().value
    }

    pub fn is_closed(&self) -> bool {
        !self.node.state.lock().links.is_open()
    }

    pub fn set_edge(&self, edge: EdgeDetect) -> Result<(), GpioError> {
        let mut state = self.node.state.lock();
        state.links.get(&self.node.name)?;
        state.edge = edge;
        Ok(())
    }

    /// Set the state of an input pin as if driven from outside. Does not
    /// cascade further.
    pub fn fake_input(&self, value: bool) -> Result<(), GpioError> {
        let name = &self.node.name;
        let mut state = self.node.state.lock();
        let ready = state.links.get(name)?.ready.clone();

        if state.direction != Direction::In {
            return Err(GpioError::Direction(format!(
                "tried to fake input for output pin {name}"
            )));
        }

        let old = state.value;
        state.value = value;
        let edge = state.edge.matches(old, value);
        drop(state);

        self.node
            .log(Direction::In, format_args!("faking input >{value}<"));

        if edge && let Some(ready) = ready {
            ready
                .write(1)
                .map_err(|e| GpioError::io(format!("signal edge on {name}"), e.into()))?;
        }
        Ok(())
    }

    /// Replace everything this output pin is wired to with `targets`.
    pub fn wire<'a>(&self, targets: impl IntoIterator<Item = &'a SimPin>) -> Result<(), GpioError> {
        let name = &self.node.name;
        {
            let state = self.node.state.lock();
            state.links.get(name)?;
            if state.direction != Direction::Out {
                return Err(GpioError::Direction(format!(
                    "only output pins can be wired, {name} is an input"
                )));
            }
        }

        let targets: Vec<&SimPin> = targets.into_iter().collect();
        let mut described = String::new();
        for target in &targets {
            let target_state = target.node.state.lock();
            target_state.links.get(&target.node.name)?;
            if target_state.direction != Direction::In {
                return Err(GpioError::Direction(format!(
                    "cannot wire {name} to output pin {}",
                    target.node.name
                )));
            }
            described.push_str(&format!(" {}({})", target.node.name, target_state.direction));
        }

        let mut state = self.node.state.lock();
        let direction = state.direction;
        state.links.get_mut(name)?.wired =
            targets.iter().map(|t| Arc::downgrade(&t.node)).collect();
        drop(state);

        self.node
            .log(direction, format_args!("now connected to{described}"));
        Ok(())
    }

    fn wired_targets(&self) -> Result<Vec<SimPin>, GpioError> {
        let state = self.node.state.lock();
        let links = state.links.get(&self.node.name)?;
        Ok(links
            .wired
            .iter()
            .filter_map(Weak::upgrade)
            .map(|node| SimPin { node })
            .collect())
    }
}

impl fmt::Debug for SimPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.node.state.lock();
        f.debug_struct("SimPin")
            .field("name", &self.node.name)
            .field("direction", &state.direction)
            .field("edge", &state.edge)
            .field("value", &state.value)
            .field("open", &state.links.is_open())
            .finish()
    }
}

impl GpioPin for SimPin {
    fn name(&self) -> String {
        self.node.name.clone()
    }

    fn direction(&self) -> Result<Direction, GpioError> {
        let state = self.node.state.lock();
        state.links.get(&self.node.name)?;
        Ok(state.direction)
    }

    fn set_direction(&self, direction: Direction) -> Result<(), GpioError> {
        let mut state = self.node.state.lock();
        state.links.get(&self.node.name)?;
        state.direction = direction;
        drop(state);
        self.node
            .log(direction, format_args!("direction set to {}", direction.as_str()));
        Ok(())
    }

    fn state(&self) -> Result<bool, GpioError> {
        let name = &self.node.name;
        let state = self.node.state.lock();
        if let Some(ready) = &state.links.get(name)?.ready {
            match ready.read() {
                Ok(_) | Err(Errno::EAGAIN) => {}
                Err(e) => return Err(GpioError::io(format!("clear edge on {name}"), e.into())),
            }
        }
        Ok(state.value)
    }

    /// Drive an output pin and every input wired to it. Fails before
    /// changing anything if this pin or a wired target has the wrong
    /// direction.
    fn set_state(&self, value: bool) -> Result<(), GpioError> {
        let name = &self.node.name;
        if self.direction()? != Direction::Out {
            return Err(GpioError::Direction(format!(
                "tried to set state on input pin {name}"
            )));
        }

        let targets: Vec<SimPin> = self
            .wired_targets()?
            .into_iter()
            .filter(|t| !t.is_closed())
            .collect();
        for target in &targets {
            if target.direction()? != Direction::In {
                return Err(GpioError::Direction(format!(
                    "{name} is wired to {} which is not an input",
                    target.node.name
                )));
            }
        }

        self.node.state.lock().value = value;
        self.node
            .log(Direction::Out, format_args!("set to state >{value}<"));

        for target in &targets {
            match target.fake_input(value) {
                // closed since the check above
                Err(GpioError::Closed(_)) => continue,
                other => other?,
            }
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.node.state.lock();
        let Lifecycle::Open(links) = std::mem::replace(&mut state.links, Lifecycle::Closed) else {
            return;
        };
        let direction = state.direction;
        drop(state);

        // wake an attached monitor so it observes the closed handle
        if let Some(ready) = links.ready
            && let Err(e) = ready.write(1)
        {
            log::warn!("failed to wake monitor of {}: {e}", self.node.name);
        }
        self.node.log(direction, format_args!("closed"));
    }
}

impl EdgeSource for SimPin {
    fn edge(&self) -> Result<EdgeDetect, GpioError> {
        let state = self.node.state.lock();
        state.links.get(&self.node.name)?;
        Ok(state.edge)
    }

    fn claim(&self) -> Result<Claim, GpioError> {
        let name = &self.node.name;
        let mut state = self.node.state.lock();
        let links = state.links.get_mut(name)?;

        if self
            .node
            .monitored
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GpioError::Conflict(format!(
                "{name} already has an edge monitor"
            )));
        }

        if links.ready.is_none() {
            match EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK) {
                Ok(fd) => links.ready = Some(Arc::new(fd)),
                Err(e) => {
                    self.node.monitored.store(false, Ordering::SeqCst);
                    return Err(GpioError::io(format!("edge eventfd for {name}"), e.into()));
                }
            }
        }

        let node = self.node.clone();
        Ok(Claim::new(move || {
            node.monitored.store(false, Ordering::SeqCst);
        }))
    }

    fn wait_edge(
        &self,
        cancel: &Canceller,
        timeout: Option<Duration>,
    ) -> Result<Wake, GpioError> {
        let name = &self.node.name;
        let ready = self
            .node
            .state
            .lock()
            .links
            .get(name)?
            .ready
            .clone()
            .ok_or_else(|| GpioError::Config(format!("{name} is not claimed by a monitor")))?;
        wait_ready(ready.as_fd(), PollFlags::POLLIN, cancel, timeout, name)
    }
}
