use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// Work items foreign threads marshal onto the loop thread. All watch-point
/// state is loop-thread exclusive, so this is the only way in.
#[derive(Debug)]
pub(crate) enum Request {
    Register(Vec<PathBuf>),
    Unregister(Vec<PathBuf>),
    Terminate,
}

#[derive(Debug)]
pub(crate) struct Command {
    pub request: Request,
    pub completion: Arc<Completion>,
}

/// One-shot completion signal shared between a submitter and the loop.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    result: Mutex<Option<Result<bool>>>,
    ready: Condvar,
}

impl Completion {
    /// First result wins; later calls are ignored so the signal stays
    /// one-shot even when teardown races the command body.
    pub fn finish(&self, result: Result<bool>) {
        let mut slot = self.result.lock().unwrap();
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_all();
        }
    }

    /// Blocks until the loop finished the command. A timeout is a failure,
    /// not a silent drop; the loop may still run the command later.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let slot = self.result.lock().unwrap();
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap();
        match slot.take() {
            Some(result) => result,
            None => Err(Error::CommandTimeout),
        }
    }
}

/// FIFO of commands, protected by a single mutex.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: Mutex<VecDeque<Command>>,
}

impl CommandQueue {
    pub fn push(&self, command: Command) {
        self.commands.lock().unwrap().push_back(command);
    }

    /// Moves every queued command out. Callers execute them after the lock is
    /// released; command bodies mutate the watch table and may unblock
    /// submitters, so running them under the lock is forbidden.
    pub fn drain(&self) -> VecDeque<Command> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn command(request: Request) -> Command {
        Command {
            request,
            completion: Arc::new(Completion::default()),
        }
    }

    #[test]
    fn queue_preserves_submission_order() {
        let queue = CommandQueue::default();
        queue.push(command(Request::Register(vec![PathBuf::from("/data/a")])));
        queue.push(command(Request::Unregister(vec![PathBuf::from("/data/a")])));
        queue.push(command(Request::Terminate));

        let drained = queue.drain();
        assert!(matches!(drained[0].request, Request::Register(_)));
        assert!(matches!(drained[1].request, Request::Unregister(_)));
        assert!(matches!(drained[2].request, Request::Terminate));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn wait_returns_finished_result() {
        let completion = Completion::default();
        completion.finish(Ok(false));
        assert_eq!(completion.wait(Duration::from_secs(1)).unwrap(), false);
    }

    #[test]
    fn wait_times_out_without_result() {
        let completion = Completion::default();
        let result = completion.wait(Duration::from_millis(20));
        assert!(matches!(result, Err(Error::CommandTimeout)));
    }

    #[test]
    fn first_result_wins() {
        let completion = Completion::default();
        completion.finish(Ok(true));
        completion.finish(Err(Error::Terminated));
        assert_eq!(completion.wait(Duration::from_secs(1)).unwrap(), true);
    }

    #[test]
    fn wait_observes_result_from_other_thread() {
        let completion = Arc::new(Completion::default());
        let finisher = {
            let completion = Arc::clone(&completion);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                completion.finish(Ok(true));
            })
        };
        assert_eq!(completion.wait(Duration::from_secs(5)).unwrap(), true);
        finisher.join().unwrap();
    }
}
