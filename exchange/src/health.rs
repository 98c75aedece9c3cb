/// Connection health of a live tick subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionHealth {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
}

impl ConnectionHealth {
    pub fn is_connected(self) -> bool {
        self == ConnectionHealth::Connected
    }
}
