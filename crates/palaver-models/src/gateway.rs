// Client -> Server opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;

// Server -> Client opcodes
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;

// Server dispatch events
pub const EVENT_READY: &str = "ready";
pub const EVENT_NEW_MESSAGE: &str = "new_message";
pub const EVENT_MESSAGE_STATUS_UPDATE: &str = "message_status_update";
pub const EVENT_MESSAGES_SEEN_BULK: &str = "messages_seen_bulk";
pub const EVENT_CONVERSATION_UPDATED: &str = "conversation_updated";
pub const EVENT_CONVERSATION_REAPPEARED: &str = "conversation_reappeared";
pub const EVENT_ADMIN_TRANSFERRED: &str = "admin_transferred";
pub const EVENT_PROMOTED_TO_ADMIN: &str = "promoted_to_admin";
pub const EVENT_USER_ONLINE: &str = "user_online";
pub const EVENT_USER_OFFLINE: &str = "user_offline";
pub const EVENT_TYPING_START: &str = "typing_start";
pub const EVENT_TYPING_STOP: &str = "typing_stop";
pub const EVENT_ERROR: &str = "error";
/// Internal: tells a superseded session loop to shut down after the same
/// user registered a newer connection.
pub const EVENT_SESSION_REPLACED: &str = "session_replaced";

// Client dispatch events
pub const CLIENT_JOIN_CONVERSATION: &str = "join_conversation";
pub const CLIENT_LEAVE_CONVERSATION: &str = "leave_conversation";
pub const CLIENT_CONVERSATION_VIEWED: &str = "conversation_viewed";
pub const CLIENT_SEND_MESSAGE: &str = "send_message";
pub const CLIENT_MESSAGE_DELIVERED: &str = "message_delivered";
pub const CLIENT_MESSAGE_SEEN: &str = "message_seen";
pub const CLIENT_MARK_CONVERSATION_READ: &str = "mark_conversation_read";
pub const CLIENT_TYPING_START: &str = "typing_start";
pub const CLIENT_TYPING_STOP: &str = "typing_stop";
pub const CLIENT_CREATE_DIRECT: &str = "create_direct";
pub const CLIENT_CREATE_GROUP: &str = "create_group";
pub const CLIENT_RENAME_CONVERSATION: &str = "rename_conversation";
pub const CLIENT_ADD_MEMBER: &str = "add_member";
pub const CLIENT_REMOVE_MEMBER: &str = "remove_member";
pub const CLIENT_HIDE_CONVERSATION: &str = "hide_conversation";
pub const CLIENT_UNHIDE_CONVERSATION: &str = "unhide_conversation";
pub const CLIENT_CLEAR_HISTORY: &str = "clear_history";
pub const CLIENT_LEAVE_GROUP: &str = "leave_group";

// Error codes carried by EVENT_ERROR payloads
pub const ERR_UNKNOWN_CONVERSATION: &str = "unknown_conversation";
pub const ERR_UNKNOWN_MESSAGE: &str = "unknown_message";
pub const ERR_NOT_PARTICIPANT: &str = "not_participant";
pub const ERR_BAD_PAYLOAD: &str = "bad_payload";
pub const ERR_RATE_LIMITED: &str = "rate_limited";
pub const ERR_INTERNAL: &str = "internal";
