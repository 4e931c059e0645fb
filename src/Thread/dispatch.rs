//! Per-actor-type dispatch tables.
//!
//! A `MessageMap` is an ordered list of `(message id, handler)` entries plus
//! an optional parent map. `lookup` scans the entries linearly and falls back
//! to the parent on a miss, so a derived table overrides its base by listing
//! the same id. Every chain normally ends in `lifecycle_map`, which routes the
//! reserved ids to the `Actor` hooks.

use super::actor::{Actor, ActorContext};
use crate::error::Result;
use crate::Queue::Structs::Queue_Structs::{INIT, QUIT, SUSPEND, TIMER};
use crate::Queue::ThreadMessage;

pub type NotifyFn<A> = fn(&mut A, &ActorContext) -> Result<()>;
pub type MessageFn<A> = fn(&mut A, &ActorContext, &ThreadMessage) -> Result<()>;
pub type ValueFn<A> = fn(&mut A, &ActorContext, i64) -> Result<()>;

/// How a handler wants its message delivered.
pub enum Handler<A> {
    /// Id only.
    Notify(NotifyFn<A>),
    /// The whole message.
    Message(MessageFn<A>),
    /// The 64-bit payload.
    Value(ValueFn<A>),
}

impl<A> Clone for Handler<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for Handler<A> {}

impl<A> Handler<A> {
    pub fn invoke(self, actor: &mut A, ctx: &ActorContext, message: &ThreadMessage) -> Result<()> {
        match self {
            Handler::Notify(f) => f(actor, ctx),
            Handler::Message(f) => f(actor, ctx, message),
            Handler::Value(f) => f(actor, ctx, message.quad()),
        }
    }
}

pub struct MessageMap<A> {
    entries: Vec<(u32, Handler<A>)>,
    base: Option<Box<MessageMap<A>>>,
}

impl<A> Default for MessageMap<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            base: None,
        }
    }
}

impl<A> MessageMap<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fall back to `base` for ids this map does not list.
    pub fn inherit(mut self, base: MessageMap<A>) -> Self {
        self.base = Some(Box::new(base));
        self
    }

    pub fn on_notify(mut self, msg_id: u32, handler: NotifyFn<A>) -> Self {
        self.entries.push((msg_id, Handler::Notify(handler)));
        self
    }

    pub fn on_message(mut self, msg_id: u32, handler: MessageFn<A>) -> Self {
        self.entries.push((msg_id, Handler::Message(handler)));
        self
    }

    pub fn on_value(mut self, msg_id: u32, handler: ValueFn<A>) -> Self {
        self.entries.push((msg_id, Handler::Value(handler)));
        self
    }

    pub fn lookup(&self, msg_id: u32) -> Option<Handler<A>> {
        let mut map = Some(self);
        while let Some(current) = map {
            if let Some((_, handler)) = current.entries.iter().find(|(id, _)| *id == msg_id) {
                return Some(*handler);
            }
            map = current.base.as_deref();
        }
        None
    }

    /// Number of maps in the chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.base.as_ref().map_or(0, |base| base.depth())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn init_hook<A: Actor>(actor: &mut A, ctx: &ActorContext) -> Result<()> {
    actor.on_init(ctx)
}

fn quit_hook<A: Actor>(actor: &mut A, ctx: &ActorContext) -> Result<()> {
    actor.on_quit(ctx)
}

fn suspend_hook<A: Actor>(actor: &mut A, ctx: &ActorContext) -> Result<()> {
    actor.on_suspend(ctx)
}

fn timer_hook<A: Actor>(actor: &mut A, ctx: &ActorContext, timer_id: i64) -> Result<()> {
    actor.on_timer(ctx, timer_id as u64)
}

/// The root table: reserved lifecycle ids mapped onto the `Actor` hooks.
pub fn lifecycle_map<A: Actor>() -> MessageMap<A> {
    MessageMap::new()
        .on_notify(INIT, init_hook::<A>)
        .on_notify(QUIT, quit_hook::<A>)
        .on_notify(SUSPEND, suspend_hook::<A>)
        .on_value(TIMER, timer_hook::<A>)
}

/// Build an actor's static dispatch table once and hand out `&'static`.
///
/// ```ignore
/// fn message_map() -> &'static MessageMap<Self> {
///     message_map!(Counter, {
///         on_value ADD => Counter::add,
///         on_notify RESET => Counter::reset,
///     })
/// }
/// ```
///
/// Without `base = ...` the table inherits `lifecycle_map::<Actor>()`.
#[macro_export]
macro_rules! message_map {
    ($actor:ty, base = $base:expr, { $($kind:ident $id:expr => $handler:expr),* $(,)? }) => {{
        static MAP: ::std::sync::OnceLock<$crate::Thread::MessageMap<$actor>> =
            ::std::sync::OnceLock::new();
        MAP.get_or_init(|| {
            $crate::Thread::MessageMap::<$actor>::new()
                .inherit($base)
                $( .$kind($id, $handler) )*
        })
    }};
    ($actor:ty, { $($kind:ident $id:expr => $handler:expr),* $(,)? }) => {
        $crate::message_map!(
            $actor,
            base = $crate::Thread::lifecycle_map::<$actor>(),
            { $($kind $id => $handler),* }
        )
    };
}
