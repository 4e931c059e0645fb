pub mod actor;
pub mod basic;
pub mod dispatch;
pub mod timer;

pub use actor::{
    public_queue_id, pump_message, Actor, ActorContext, ActorOptions, ActorRef, ActorThread,
    PumpStatus, THREADS_PER_APP,
};
pub use basic::{RunState, ThreadBasic, ThreadRef};
pub use dispatch::{lifecycle_map, Handler, MessageMap};
pub use timer::Timer;
pub use crate::Queue::Structs::Queue_Structs::{
    INIT, QUIT, SOCKET_ACCEPT, SOCKET_CLOSE, SOCKET_CONNECT, SOCKET_ERROR, SUSPEND, TIMER, USER,
};
pub use crate::Queue::ThreadMessage;
