/// Scripted in-process driver for exercising the builder/execution lifecycle without a server
pub mod scripted;

pub use scripted::{
    CommandRecord, ScriptedConnection, ScriptedEvent, ScriptedFault, ScriptedJournal,
    ScriptedVendor, construction_count,
};
