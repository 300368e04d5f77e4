//! Transport commands and the engine's command queue

use crate::decoder::View;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// Request handled by the engine thread
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Open the decoder and build the session
    Init,

    Play,

    Stop,

    /// Move to a time in milliseconds
    Seek(i64),

    AdjustSpeed(f32),

    /// Show the next frame while stopped
    Step,

    SetView(View),

    /// Rewind to the start
    Reset,

    /// Close the session and end the command loop
    Shutdown,
}

impl TransportCommand {
    /// Whether a run of commands like this one collapses to the last of them
    fn coalesces_with(&self, next: &TransportCommand) -> bool {
        matches!(
            (self, next),
            (TransportCommand::Seek(_), TransportCommand::Seek(_))
                | (TransportCommand::Play, TransportCommand::Play)
        )
    }
}

/// Receiving end of the engine's commands
///
/// A seek or play is executed only after every command of the same kind
/// queued right behind it has been folded in, so dragging a position slider
/// costs one seek rather than one per intermediate position.
pub struct CommandQueue {
    rx: Receiver<TransportCommand>,
    /// First command after a coalesced run
    stashed: Option<TransportCommand>,
}

impl CommandQueue {
    pub fn channel() -> (Sender<TransportCommand>, CommandQueue) {
        let (tx, rx) = unbounded();
        (tx, CommandQueue { rx, stashed: None })
    }

    pub fn receiver(&self) -> &Receiver<TransportCommand> {
        &self.rx
    }

    /// Command left over from the last coalesced run, which runs next
    pub fn take_stashed(&mut self) -> Option<TransportCommand> {
        self.stashed.take()
    }

    /// Fold the commands queued behind `command` that share its kind
    pub fn coalesce(&mut self, mut command: TransportCommand) -> TransportCommand {
        if self.stashed.is_some() {
            return command;
        }
        loop {
            match self.rx.try_recv() {
                Ok(next) if command.coalesces_with(&next) => command = next,
                Ok(next) => {
                    self.stashed = Some(next);
                    return command;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return command,
            }
        }
    }

    /// Next command to execute, blocking; `None` once every sender is gone
    pub fn next(&mut self) -> Option<TransportCommand> {
        let command = match self.take_stashed() {
            Some(command) => command,
            None => self.rx.recv().ok()?,
        };
        Some(self.coalesce(command))
    }
}
