/// Chat row as stored. Ids and timestamps are kept as text; the gateway
/// converts them back into typed values.
#[derive(Debug, Clone)]
pub struct ChatMessageRow {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRow {
    pub room_id: String,
    pub page_index: u32,
}

#[derive(Debug, Clone)]
pub struct StrokeRow {
    pub room_id: String,
    pub page_index: u32,
    /// Serialized JSON of the opaque stroke payload
    pub stroke: String,
}
