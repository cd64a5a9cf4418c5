//! Pure translation of [`TransportOptions`] into rumqttc options

use crate::transport::TransportOptions;
use rumqttc::v5::MqttOptions;

/// Largest packet the client accepts, brokers default far lower
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Build MQTT options; unset settings keep rumqttc's defaults
pub fn configure_mqtt_options(options: &TransportOptions) -> MqttOptions {
    let mut mqtt_options =
        MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);

    // Brokers with authentication enabled want some username even when the
    // password alone identifies the account
    if options.username.is_some() || options.password.is_some() {
        let username = options.username.clone().unwrap_or_default();
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    if let Some(keep_alive) = options.keep_alive {
        mqtt_options.set_keep_alive(keep_alive);
    }

    if let Some(clean_session) = options.clean_session {
        mqtt_options.set_clean_start(clean_session);
    }

    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    mqtt_options
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> TransportOptions {
        TransportOptions::new("broker.local", 1884, "v1/agents/web.fey.example.org")
    }

    #[test]
    fn test_basic_options() {
        let mqtt_options = configure_mqtt_options(&options());
        assert_eq!(mqtt_options.client_id(), "v1/agents/web.fey.example.org");
        assert_eq!(
            mqtt_options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
    }

    #[test]
    fn test_optional_settings_are_applied() {
        let mut options = options();
        options.username = Some("v2::service".to_string());
        options.password = Some("secret".to_string());
        options.keep_alive = Some(Duration::from_secs(30));
        options.clean_session = Some(false);

        let mqtt_options = configure_mqtt_options(&options);
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(30));
        assert!(!mqtt_options.clean_start());
    }
}
