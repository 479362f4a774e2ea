use serde::Deserialize;

/// Top-level server configuration, loaded from `ringside.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub rooms: RoomPoolConfig,
    pub battle: BattleTuning,
    pub limits: LimitsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8334".to_string(),
            rooms: RoomPoolConfig::default(),
            battle: BattleTuning::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Size and shape of the preallocated room pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoomPoolConfig {
    pub count: usize,
    pub capacity: usize,
}

impl Default for RoomPoolConfig {
    fn default() -> Self {
        Self {
            count: 32,
            capacity: 2,
        }
    }
}

/// Per-room frame-sync tunables. Everything frame-counted is in render
/// frames unless the name says otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BattleTuning {
    pub server_fps: i32,
    pub input_delay_frames: i32,
    /// Network single-trip delay; proposed to be `input_delay_frames >> 1`
    /// so a round trip matches the full input delay.
    pub nst_delay_frames: i32,
    /// Input-frame period is `1 << input_scale_frames` render frames.
    pub input_scale_frames: u32,
    pub battle_duration_frames: i32,
    pub render_cache_size: usize,
    pub backend_dynamics_enabled: bool,
    /// Extra input-buffer retention for skills that look at old inputs.
    pub sp_atk_lookup_frames: i32,
    pub battle_preparation_millis: u64,
}

impl Default for BattleTuning {
    fn default() -> Self {
        Self {
            server_fps: 60,
            input_delay_frames: 8,
            nst_delay_frames: 4,
            input_scale_frames: 2,
            battle_duration_frames: 30 * 60,
            render_cache_size: 1024,
            backend_dynamics_enabled: true,
            sp_atk_lookup_frames: 5,
            battle_preparation_millis: 6_000,
        }
    }
}

impl BattleTuning {
    pub fn rollback_estimated_dt_nanos(&self) -> i64 {
        1_000_000_000 / i64::from(self.server_fps)
    }

    /// Slightly slower than the client frame rate so clients keep up with
    /// (or surpass) the backend when server-side dynamics is enabled.
    pub fn diluted_rollback_estimated_dt_nanos(&self) -> i64 {
        self.rollback_estimated_dt_nanos() * 12 / 11
    }

    pub fn battle_duration_nanos(&self) -> i64 {
        i64::from(self.battle_duration_frames) * self.rollback_estimated_dt_nanos()
    }

    pub fn input_buffer_size(&self) -> usize {
        (self.render_cache_size >> 2) + 1
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_ws_connections: usize,
    /// Bound of the per-player outbound message channel.
    pub player_message_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_ws_connections: 4096,
            player_message_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Validate configuration; exits on values the server cannot run with.
    pub fn validate(&self) {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            tracing::error!(addr = %self.listen_addr, "listen_addr is not a valid socket address");
            std::process::exit(1);
        }
        if self.rooms.capacity < 2 || self.rooms.capacity > 8 {
            tracing::error!(capacity = self.rooms.capacity, "room capacity must be in 2..=8");
            std::process::exit(1);
        }
        if self.battle.server_fps <= 0 {
            tracing::error!(fps = self.battle.server_fps, "server_fps must be positive");
            std::process::exit(1);
        }
        if self.battle.input_scale_frames >= 8 {
            tracing::error!(
                input_scale_frames = self.battle.input_scale_frames,
                "input_scale_frames is unreasonably large"
            );
            std::process::exit(1);
        }
        if self.battle.render_cache_size < 64 {
            tracing::error!(
                render_cache_size = self.battle.render_cache_size,
                "render_cache_size too small to cover the resync window"
            );
            std::process::exit(1);
        }
    }

    /// Load config from `ringside.toml` if present, then apply env var
    /// overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("ringside.toml") {
            Ok(content) => match toml::from_str::<ServerConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from ringside.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse ringside.toml: {e}, using defaults");
                    ServerConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No ringside.toml found, using defaults");
                ServerConfig::default()
            },
        };

        if let Ok(addr) = std::env::var("RINGSIDE_LISTEN_ADDR") {
            if !addr.is_empty() {
                config.listen_addr = addr;
            }
        }
        if let Ok(count) = std::env::var("RINGSIDE_ROOM_COUNT") {
            if let Ok(parsed) = count.parse() {
                config.rooms.count = parsed;
            }
        }
        if let Ok(capacity) = std::env::var("RINGSIDE_ROOM_CAPACITY") {
            if let Ok(parsed) = capacity.parse() {
                config.rooms.capacity = parsed;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tunables_match_frame_sync_contract() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.rooms.capacity, 2);
        assert_eq!(cfg.battle.server_fps, 60);
        assert_eq!(cfg.battle.rollback_estimated_dt_nanos(), 16_666_666);
        assert_eq!(cfg.battle.input_delay_frames, 8);
        assert_eq!(cfg.battle.nst_delay_frames, 4);
        assert_eq!(cfg.battle.input_scale_frames, 2);
        assert_eq!(cfg.battle.battle_duration_frames, 1800);
        assert_eq!(cfg.battle.input_buffer_size(), 257);
        assert!(cfg.battle.backend_dynamics_enabled);
    }

    #[test]
    fn diluted_dt_is_slower_than_dt() {
        let cfg = BattleTuning::default();
        assert!(cfg.diluted_rollback_estimated_dt_nanos() > cfg.rollback_estimated_dt_nanos());
        assert_eq!(
            cfg.diluted_rollback_estimated_dt_nanos(),
            cfg.rollback_estimated_dt_nanos() * 12 / 11
        );
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let toml_str = r#"
listen_addr = "127.0.0.1:9000"

[battle]
battle_duration_frames = 600

[rooms]
count = 4
"#;
        let cfg: ServerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.battle.battle_duration_frames, 600);
        assert_eq!(cfg.battle.server_fps, 60);
        assert_eq!(cfg.rooms.count, 4);
        assert_eq!(cfg.rooms.capacity, 2);
    }
}
