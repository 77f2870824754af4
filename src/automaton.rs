use core::hash::Hash;
use std::collections::hash_map::{Entry, HashMap};

/// Returned by [`Automaton::receive`] to say whether a task has everything it
/// needs to run.
pub enum Status {
    Eligible,
    Ineligible,
}

impl Status {
    pub fn eligible_if(condition: bool) -> Self {
        if condition {
            Self::Eligible
        } else {
            Self::Ineligible
        }
    }
}

/// A task in a group which exchanges messages with its peers and then yields
/// a value. Tasks own their data and transfer ownership of message buffers to
/// the recipient, so nothing is shared between threads while the group runs.
/// In this crate the tasks are patches exchanging guard zone data with their
/// neighbors on the same level.
///
pub trait Automaton {
    /// Uniquely identifies a task within its group. Executors require this
    /// to be `Hash + Eq`.
    type Key;

    /// The type of a message passed between tasks.
    type Message;

    /// The value yielded by the task once it has received every incoming
    /// message. The executor may compute it on a worker thread.
    type Value;

    /// Return the key of this task.
    fn key(&self) -> Self::Key;

    /// Return the messages to be delivered to peers, addressed by key.
    fn messages(&self) -> Vec<(Self::Key, Self::Message)>;

    /// Take ownership of a message from a peer, and report whether the task
    /// is now eligible to run. Called once per incoming message.
    fn receive(&mut self, message: Self::Message) -> Status;

    /// Return true if this task expects no messages at all. Such a task is
    /// eligible as soon as the coordinator sees it.
    fn is_independent(&self) -> bool {
        false
    }

    /// Run the task. CPU-intensive work belongs here.
    fn value(self) -> Self::Value;
}

/// Execute a group of tasks in serial.
///
pub fn execute<I, A, K, V>(stage: I) -> impl Iterator<Item = V>
where
    I: IntoIterator<Item = A>,
    A: Automaton<Key = K, Value = V>,
    K: Hash + Eq,
{
    let (eligible_sink, eligible_source) = crossbeam_channel::unbounded();

    coordinate(stage, eligible_sink);

    eligible_source.into_iter().map(|peer: A| peer.value())
}

/// Execute a group of tasks in parallel, spawning work into the given Rayon
/// scope. A coordinator delivers messages as tasks are drawn from `flow`,
/// and hands tasks that have become eligible to a dispatcher, which runs
/// them on the thread pool and sends their values to the returned iterator.
///
/// _Note_: the coordinator and dispatcher run concurrently, so the Rayon
/// pool must have at least two threads. Callers fall back to [`execute`]
/// otherwise.
///
pub fn execute_par<'a, I, A, K, V>(scope: &rayon::Scope<'a>, flow: I) -> impl Iterator<Item = V>
where
    I: IntoIterator<Item = A>,
    A: Send + Automaton<Key = K, Value = V> + 'a,
    K: Hash + Eq,
    V: Send + 'a,
{
    use rayon::prelude::*;

    assert!{
        rayon::current_num_threads() >= 2,
        "automaton::execute_par requires at least two threads to be running"
    };

    let (eligible_sink, eligible_source) = crossbeam_channel::unbounded();
    let (computed_sink, computed_source) = crossbeam_channel::unbounded();

    scope.spawn(move |_| {
        eligible_source
            .into_iter()
            .par_bridge()
            .for_each(|peer: A| {
                computed_sink
                    .send(peer.value())
                    .unwrap_or_else(|_| panic!("automaton result receiver hung up"))
            })
    });

    coordinate(flow, eligible_sink);
    computed_source.into_iter()
}

fn coordinate<I, A, K, V>(flow: I, eligible: crossbeam_channel::Sender<A>)
where
    I: IntoIterator<Item = A>,
    A: Automaton<Key = K, Value = V>,
    K: Hash + Eq,
{
    let dispatch = |a: A| {
        eligible
            .send(a)
            .unwrap_or_else(|_| panic!("automaton dispatcher hung up"))
    };
    let mut seen: HashMap<K, A> = HashMap::new();
    let mut undelivered = Vec::new();

    for mut a in flow {
        // Deliver A's messages to peers already seen, and hold the rest.
        // Peers which become eligible are dispatched right away.
        for (dest, data) in a.messages() {
            match seen.entry(dest) {
                Entry::Occupied(mut entry) => {
                    if let Status::Eligible = entry.get_mut().receive(data) {
                        dispatch(entry.remove())
                    }
                }
                Entry::Vacant(none) => undelivered.push((none.into_key(), data)),
            }
        }

        // Deliver held messages addressed to A.
        let dest = a.key();
        let mut i = 0;
        let mut is_eligible = a.is_independent();

        while !is_eligible && i != undelivered.len() {
            if undelivered[i].0 == dest {
                if let Status::Eligible = a.receive(undelivered.remove(i).1) {
                    is_eligible = true;
                }
            } else {
                i += 1;
            }
        }

        if is_eligible {
            dispatch(a);
        } else {
            seen.insert(dest, a);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{execute, Automaton, Status};

    /// Each task sends its key to the next one in a ring, except task 0
    /// which only listens.
    struct Ring {
        key: usize,
        size: usize,
        inbox: Vec<usize>,
    }

    impl Automaton for Ring {
        type Key = usize;
        type Message = usize;
        type Value = (usize, Vec<usize>);

        fn key(&self) -> usize {
            self.key
        }

        fn messages(&self) -> Vec<(usize, usize)> {
            if self.key + 1 < self.size {
                vec![(self.key + 1, self.key)]
            } else {
                vec![]
            }
        }

        fn receive(&mut self, message: usize) -> Status {
            self.inbox.push(message);
            Status::eligible_if(self.inbox.len() == 1)
        }

        fn is_independent(&self) -> bool {
            self.key == 0
        }

        fn value(self) -> (usize, Vec<usize>) {
            (self.key, self.inbox)
        }
    }

    #[test]
    fn tasks_without_incoming_messages_still_run() {
        let tasks = (0..4).rev().map(|key| Ring { key, size: 4, inbox: vec![] });
        let mut values: Vec<_> = execute(tasks).collect();
        values.sort_by_key(|v| v.0);
        assert_eq!(values.len(), 4);
        assert!(values[0].1.is_empty());
        assert_eq!(values[3].1, vec![2]);
    }
}
