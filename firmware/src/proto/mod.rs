pub mod wifiswitch;

pub use wifiswitch::WifiswitchHandler;
