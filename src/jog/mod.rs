//! Interactive positioning of the galvos from the keyboard.
//!
//! Arrow keys step the beam by a power-of-ten multiple of the DAC quantum.
//! Positions can be stored under a name for the rest of the session, and the
//! session ends either by restoring the position it started from (`esc`) or
//! by holding the current one (`enter`).

pub mod keys;

use log::{debug, error, info, warn};
use std::io::{BufRead, Write};

pub use keys::{Key, decode_keys};

use crate::error::GalvoError;
use crate::labjack::{DaqChannels, DaqInterface};
use crate::optics::OpticalModel;
use crate::types::{DacRange, JogDirection, SavedPositions, VoltagePair};

pub const DEFAULT_COARSENESS: u32 = 4;
/// Range reachable with `+` and `-`
pub const COARSENESS_STEPS: (u32, u32) = (1, 4);

pub const HELP: &str = "\
Move using arrow keys
Increase/decrease coarseness with +/-, or pick it with 0-9
Show coarseness with c
Show position with p
Show voltage with v
Save position with s, load with l (names are case sensitive)
Reset position to origin with r
Exit and return to original position with esc
Exit and hold position with enter
Press m for more options";

const MENU: &str = "\
0: Leave this menu
1: Show saved positions
2: Manually set voltage
3: Manually set position in um";

/// Source of key presses; `None` means the input has ended
pub trait KeySource {
    fn next_key(&mut self) -> Result<Option<Key>, GalvoError>;
}

/// Line-oriented questions and status messages
pub trait Prompt {
    fn ask(&mut self, question: &str) -> Result<String, GalvoError>;
    fn say(&mut self, message: &str);
}

/// Console reading one key name per line, for terminals without raw mode
/// and for piping scripted sessions
pub struct LineConsole<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LineConsole<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_line(&mut self) -> Result<Option<String>, GalvoError> {
        let mut line = String::new();
        let read = self.input.read_line(&mut line).map_err(|source| GalvoError::Io {
            source,
            context: "Failed to read console input".to_string(),
        })?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

impl<R: BufRead, W: Write> KeySource for LineConsole<R, W> {
    fn next_key(&mut self) -> Result<Option<Key>, GalvoError> {
        while let Some(line) = self.read_line()? {
            match Key::from_name(&line) {
                Some(key) => return Ok(Some(key)),
                None => self.say(&format!("Unknown key: {line}")),
            }
        }
        Ok(None)
    }
}

impl<R: BufRead, W: Write> Prompt for LineConsole<R, W> {
    fn ask(&mut self, question: &str) -> Result<String, GalvoError> {
        self.say(question);
        Ok(self.read_line()?.unwrap_or_default().trim().to_string())
    }

    fn say(&mut self, message: &str) {
        let _ = writeln!(self.output, "{message}");
        let _ = self.output.flush();
    }
}

/// How a jog session ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JogExit {
    /// Mirrors returned to where the session started
    Restored(VoltagePair),
    /// Mirrors left at the final position
    Held(VoltagePair),
}

/// Keyboard-driven mirror positioning
///
/// The controller owns the DAQ handle until [`JogController::close`] (or one
/// of the exits) releases it. Every committed move is a paired write of both
/// axes and is checked against the DAC range first; a move that would leave
/// the range is refused and nothing changes.
pub struct JogController<D: DaqInterface> {
    daq: Option<D>,
    channels: DaqChannels,
    dac: DacRange,
    optics: OpticalModel,
    position: VoltagePair,
    /// `position` has been set but not yet written
    pending: bool,
    origin: VoltagePair,
    coarseness: u32,
    saved: SavedPositions,
}

impl<D: DaqInterface> JogController<D> {
    pub fn new(daq: D, channels: DaqChannels, dac: DacRange, optics: OpticalModel) -> Self {
        Self {
            daq: Some(daq),
            channels,
            dac,
            optics,
            position: VoltagePair::ORIGIN,
            pending: false,
            origin: VoltagePair::ORIGIN,
            coarseness: DEFAULT_COARSENESS,
            saved: SavedPositions::new(),
        }
    }

    /// Start from a position the mirrors are already known to sit at
    ///
    /// The position becomes the one `esc` restores, so it must be inside the
    /// DAC range.
    pub fn with_position(mut self, position: VoltagePair) -> Result<Self, GalvoError> {
        self.dac.check(position)?;
        self.position = position;
        self.origin = position;
        Ok(self)
    }

    pub fn position(&self) -> VoltagePair {
        self.position
    }

    /// Whether the position was staged by [`set_position`](Self::set_position)
    /// and not yet written
    pub fn has_pending(&self) -> bool {
        self.pending
    }

    pub fn origin(&self) -> VoltagePair {
        self.origin
    }

    pub fn coarseness(&self) -> u32 {
        self.coarseness
    }

    pub fn saved(&self) -> &SavedPositions {
        &self.saved
    }

    pub fn is_open(&self) -> bool {
        self.daq.as_ref().is_some_and(|daq| daq.is_open())
    }

    /// Voltage change of one arrow key press
    pub fn step_size(&self) -> f64 {
        self.dac.quantum() * 10f64.powi(self.coarseness as i32 - 1)
    }

    pub fn set_coarseness(&mut self, coarseness: u32) -> u32 {
        self.coarseness = coarseness.min(9);
        self.coarseness
    }

    pub fn coarser(&mut self) -> u32 {
        if self.coarseness < COARSENESS_STEPS.1 {
            self.coarseness += 1;
        }
        self.coarseness
    }

    pub fn finer(&mut self) -> u32 {
        if self.coarseness > COARSENESS_STEPS.0 {
            self.coarseness -= 1;
        }
        self.coarseness
    }

    /// Move one step; refused with `Limit` if the result leaves the DAC range
    pub fn step(&mut self, direction: JogDirection) -> Result<VoltagePair, GalvoError> {
        let (axis, sign) = direction.axis_and_sign();
        let target = self
            .position
            .with(axis, self.position.get(axis) + sign * self.step_size());
        self.move_to(target)?;
        Ok(target)
    }

    /// Write `pair` to the mirrors
    pub fn set_voltage(&mut self, pair: VoltagePair) -> Result<(), GalvoError> {
        self.move_to(pair)
    }

    /// Stage the voltages for a position in micrometres
    ///
    /// The mirrors do not move until the next committed move or
    /// [`commit`](Self::commit).
    pub fn set_position(&mut self, x_um: f64, y_um: f64) -> Result<VoltagePair, GalvoError> {
        let target = VoltagePair::new(
            self.optics.distance_to_voltage(x_um)?,
            self.optics.distance_to_voltage(y_um)?,
        );
        self.dac.check(target)?;
        self.position = target;
        self.pending = true;
        debug!("Staged {target} for ({x_um}, {y_um}) um");
        Ok(target)
    }

    /// Write a staged position
    pub fn commit(&mut self) -> Result<(), GalvoError> {
        self.move_to(self.position)
    }

    pub fn reset(&mut self) -> Result<(), GalvoError> {
        self.move_to(VoltagePair::ORIGIN)
    }

    pub fn save(&mut self, name: &str) -> VoltagePair {
        if let Some(previous) = self.saved.save(name, self.position) {
            debug!("Replaced saved position {name} at {previous}");
        }
        self.position
    }

    /// Move to a saved position; unknown names leave everything unchanged
    pub fn load(&mut self, name: &str) -> Result<VoltagePair, GalvoError> {
        let target = self.saved.load(name)?;
        self.move_to(target)?;
        Ok(target)
    }

    /// Displacement at the sample for the current voltages, in micrometres
    pub fn distance(&self) -> Result<(f64, f64), GalvoError> {
        Ok((
            self.optics.voltage_to_distance(self.position.x)?,
            self.optics.voltage_to_distance(self.position.y)?,
        ))
    }

    /// Read the galvo position monitors, if wired
    pub fn monitors(&mut self) -> Result<Option<VoltagePair>, GalvoError> {
        let daq = self.daq.as_mut().ok_or(GalvoError::DeviceClosed)?;
        self.channels.read_monitors(daq)
    }

    /// Return to the session's starting position and release the device
    pub fn exit_restore(&mut self) -> Result<JogExit, GalvoError> {
        let origin = self.origin;
        let restored = self.move_to(origin);
        let closed = self.close();
        restored.and(closed)?;
        Ok(JogExit::Restored(origin))
    }

    /// Release the device leaving the mirrors at the current position
    pub fn exit_hold(&mut self) -> Result<JogExit, GalvoError> {
        let committed = if self.pending {
            warn!("Writing staged position {} before holding", self.position);
            self.commit()
        } else {
            Ok(())
        };
        let closed = self.close();
        committed.and(closed)?;
        Ok(JogExit::Held(self.position))
    }

    pub fn close(&mut self) -> Result<(), GalvoError> {
        let mut daq = self.daq.take().ok_or(GalvoError::DeviceClosed)?;
        daq.close().inspect_err(|e| error!("Failed to release the DAQ: {e}"))
    }

    fn move_to(&mut self, target: VoltagePair) -> Result<(), GalvoError> {
        self.dac.check(target)?;
        let daq = self.daq.as_mut().ok_or(GalvoError::DeviceClosed)?;
        self.channels.write_pair(daq, target)?;
        self.position = target;
        self.pending = false;
        Ok(())
    }

    /// Run the interactive loop until `esc`, `enter` or the end of input
    ///
    /// Out-of-range moves, unknown names and positions outside the optical
    /// model are reported and the session continues. Device errors end the
    /// session after a best-effort release, as does any error once the
    /// device has been released. When input runs out the starting position
    /// is restored.
    pub fn run<C: KeySource + Prompt>(&mut self, console: &mut C) -> Result<JogExit, GalvoError> {
        self.origin = self.position;
        console.say(HELP);
        info!("Jog session started at {}", self.origin);

        loop {
            let Some(key) = console.next_key()? else {
                warn!("Input closed, restoring starting position");
                return self.exit_restore();
            };

            match self.handle_key(key, console) {
                Ok(Some(exit)) => {
                    info!("Jog session ended: {exit:?}");
                    return Ok(exit);
                }
                Ok(None) => {}
                Err(e) if e.is_recoverable() && self.daq.is_some() => {
                    warn!("{e}");
                    console.say(&e.to_string());
                }
                Err(e) => {
                    error!("Jog session aborted: {e}");
                    if self.daq.is_some() {
                        let _ = self.close();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn handle_key<C: Prompt>(
        &mut self,
        key: Key,
        console: &mut C,
    ) -> Result<Option<JogExit>, GalvoError> {
        match key {
            Key::Left => self.jog(JogDirection::Left)?,
            Key::Right => self.jog(JogDirection::Right)?,
            Key::Up => self.jog(JogDirection::Up)?,
            Key::Down => self.jog(JogDirection::Down)?,
            Key::Plus => {
                let c = self.coarser();
                console.say(&format!("Coarseness: {c}"));
            }
            Key::Minus => {
                let c = self.finer();
                console.say(&format!("Coarseness: {c}"));
            }
            Key::Digit(d) => {
                let c = self.set_coarseness(d as u32);
                console.say(&format!("Coarseness: {c}"));
            }
            Key::Char('c') => console.say(&format!("Coarseness: {}", self.coarseness)),
            Key::Char('v') => self.show_voltage(console, true)?,
            Key::Char('p') => self.show_position(console)?,
            Key::Char('s') => {
                let name = console.ask("Save name?")?;
                let pair = self.save(&name);
                console.say(&format!("Save name: {name} at {pair}"));
            }
            Key::Char('l') => {
                let name = console.ask("Save name?")?;
                let pair = self.load(&name)?;
                console.say(&format!("Opened {name} at {pair}"));
            }
            Key::Char('r') => {
                self.reset()?;
                console.say("Position reset to center.");
            }
            Key::Char('m') => self.menu(console)?,
            Key::Esc => {
                console.say(&format!(
                    "Reset from {} to original {}.",
                    self.position, self.origin
                ));
                return self.exit_restore().map(Some);
            }
            Key::Enter => {
                console.say("Holding current positions:");
                let exit = self.exit_hold()?;
                console.say(&format!("x: {} V; y: {} V", self.position.x, self.position.y));
                self.show_position(console)?;
                return Ok(Some(exit));
            }
            Key::Char(other) => debug!("Ignoring key {other}"),
        }
        Ok(None)
    }

    fn jog(&mut self, direction: JogDirection) -> Result<(), GalvoError> {
        let pair = self.step(direction)?;
        debug!("Jogged {direction:?} to {pair}");
        Ok(())
    }

    fn show_voltage<C: Prompt>(
        &mut self,
        console: &mut C,
        with_monitors: bool,
    ) -> Result<(), GalvoError> {
        console.say(&format!("x: {} V; y: {} V", self.position.x, self.position.y));
        if self.pending {
            console.say("(staged, not yet written)");
        }
        if with_monitors {
            if let Some(monitors) = self.monitors()? {
                if let Some(name) = &self.channels.monitor_x {
                    console.say(&format!("{name}: {}", monitors.x));
                }
                if let Some(name) = &self.channels.monitor_y {
                    console.say(&format!("{name}: {}", monitors.y));
                }
            }
        }
        Ok(())
    }

    fn show_position<C: Prompt>(&mut self, console: &mut C) -> Result<(), GalvoError> {
        let (x, y) = self.distance()?;
        console.say(&format!("x: {x:.4} um, y: {y:.4} um"));
        Ok(())
    }

    fn menu<C: Prompt>(&mut self, console: &mut C) -> Result<(), GalvoError> {
        let choice = console.ask(&format!("Select a number and hit enter to confirm:\n{MENU}"))?;
        match choice.as_str() {
            "0" => console.say("Exited."),
            "1" => {
                if self.saved.is_empty() {
                    console.say("No saved positions.");
                }
                let lines: Vec<String> = self
                    .saved
                    .iter()
                    .map(|(name, pair)| format!("{name}: {pair}"))
                    .collect();
                for line in lines {
                    console.say(&line);
                }
            }
            "2" => {
                let Some((x, y)) = ask_pair(console, "x voltage:", "y voltage:")? else {
                    return Ok(());
                };
                self.set_voltage(VoltagePair::new(x, y))?;
                console.say("Voltage set to:");
                self.show_voltage(console, false)?;
            }
            "3" => {
                let Some((x, y)) = ask_pair(console, "x position:", "y position:")? else {
                    return Ok(());
                };
                self.set_position(x, y)?;
                console.say("Position set to:");
                self.show_position(console)?;
            }
            other => console.say(&format!("No menu option {other}")),
        }
        Ok(())
    }
}

/// Ask for two numbers; a reply that does not parse cancels the entry
fn ask_pair<C: Prompt>(
    console: &mut C,
    first: &str,
    second: &str,
) -> Result<Option<(f64, f64)>, GalvoError> {
    let mut values = [0.0; 2];
    for (slot, question) in values.iter_mut().zip([first, second]) {
        let reply = console.ask(question)?;
        match reply.parse::<f64>() {
            Ok(value) if value.is_finite() => *slot = value,
            _ => {
                console.say(&format!("Not a number: {reply}"));
                return Ok(None);
            }
        }
    }
    Ok(Some((values[0], values[1])))
}
