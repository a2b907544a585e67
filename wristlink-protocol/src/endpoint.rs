//! Endpoint ids multiplexed over one connection.

pub const TIME: u16 = 11;
pub const FIRMWARE_VERSION: u16 = 16;
pub const PHONE_VERSION: u16 = 17;
pub const SYSTEM_MESSAGE: u16 = 18;
pub const APPLICATION_MESSAGE: u16 = 48;
pub const LAUNCHER: u16 = 49;
pub const APP_RUN_STATE: u16 = 52;
pub const PING: u16 = 2001;
pub const APP_LOGS: u16 = 2006;
pub const APP_MANAGER: u16 = 6000;
pub const APP_FETCH: u16 = 6001;
pub const DATALOG: u16 = 6778;
pub const BLOBDB: u16 = 0xb1db;
pub const PUT_BYTES: u16 = 0xbeef;

/// Human-readable endpoint name for logs.
pub fn name(endpoint: u16) -> &'static str {
    match endpoint {
        TIME => "time",
        FIRMWARE_VERSION => "firmware_version",
        PHONE_VERSION => "phone_version",
        SYSTEM_MESSAGE => "system_message",
        APPLICATION_MESSAGE => "application_message",
        LAUNCHER => "launcher",
        APP_RUN_STATE => "app_run_state",
        PING => "ping",
        APP_LOGS => "app_logs",
        APP_MANAGER => "app_manager",
        APP_FETCH => "app_fetch",
        DATALOG => "datalog",
        BLOBDB => "blobdb",
        PUT_BYTES => "put_bytes",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_names() {
        assert_eq!(name(PUT_BYTES), "put_bytes");
        assert_eq!(name(0xbeef), "put_bytes");
        assert_eq!(name(DATALOG), "datalog");
        assert_eq!(name(1), "unknown");
    }
}
