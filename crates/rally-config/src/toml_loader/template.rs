//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# Rally Configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[session]
# id = "session_abc123"     # generated when unset
# transport = "direct"      # direct | relay | dev_relay
# ice_routing = "broadcast" # broadcast | targeted

[signaling]
# url = "ws://localhost:42424"
# max_reconnect_attempts = 5      # 0-50
# reconnect_base_delay_ms = 1000  # 100-60000, multiplied by the attempt number
# connect_timeout_secs = 15       # 1-120

[ice]
# stun_servers = ["stun:stun.l.google.com:19302"]
# [[ice.turn_servers]]
# url = "turn:turn.example.com:3478"
# username = "user"
# credential = "secret"

[heartbeat]
# enabled = true
# interval_ms = 30000
# idle_timeout_ms = 60000   # must be greater than interval_ms

[relay]
# url = "ws://localhost:3000/cable"
# channel = "ExperienceChannel"
# reconnect_delay_secs = 1
# max_reconnect_delay_secs = 30

[logging]
# level = "rally=info"
"##
    .to_string()
}
