pub mod groups;
pub mod messages;
pub mod rooms;
