// taskhub-common: wire types shared by the realtime relay and its clients

pub mod protocol;
pub mod types;
