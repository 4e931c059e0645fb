pub mod builder;
pub(crate) mod handle;
pub mod layout;
pub mod message_queue;
pub mod thread_queue;

pub mod Structs {
    pub mod Queue_Structs;
    pub use Queue_Structs::ThreadMessage;
}

pub use self::builder::QueueBuilder;
pub use self::handle::{QueueMode, QueueSpec};
pub use self::message_queue::MessageQueue;
pub use self::thread_queue::{ThreadQueue, THREAD_SLOT_SIZE};
pub use self::Structs::ThreadMessage;
