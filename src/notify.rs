//! Push-notification categories and the notifier input type
//!
//! External collaborators (object model, alarm manager, log subsystems)
//! post updates here; each session's notifier task turns subscribed updates
//! into push messages without ever blocking the poster beyond the depth of
//! the session's notify queue.

use crate::message::Message;
use crate::protocol::command;

/// Update categories a session can subscribe to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    ObjectChange,
    AlarmChange,
    EventLog,
    SyslogRecord,
    AuditRecord,
}

impl Category {
    /// Numeric value used in subscribe/unsubscribe requests
    pub fn as_u32(self) -> u32 {
        match self {
            Category::ObjectChange => 1,
            Category::AlarmChange => 2,
            Category::EventLog => 3,
            Category::SyslogRecord => 4,
            Category::AuditRecord => 5,
        }
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Category::ObjectChange),
            2 => Some(Category::AlarmChange),
            3 => Some(Category::EventLog),
            4 => Some(Category::SyslogRecord),
            5 => Some(Category::AuditRecord),
            _ => None,
        }
    }

    /// Command code of the push message this category emits
    pub fn push_command(self) -> u16 {
        match self {
            Category::ObjectChange => command::OBJECT_UPDATE,
            Category::AlarmChange => command::ALARM_UPDATE,
            Category::EventLog => command::EVENT_LOG_RECORD,
            Category::SyslogRecord => command::SYSLOG_RECORD,
            Category::AuditRecord => command::AUDIT_RECORD,
        }
    }
}

/// One posted update: a category, a collaborator-defined change code and the
/// field payload to push. The notifier stamps the command code and a zero
/// request id (push traffic is unsolicited).
#[derive(Clone, Debug)]
pub struct Update {
    pub category: Category,
    pub code: u32,
    pub body: Message,
}

impl Update {
    pub fn new(category: Category, code: u32, body: Message) -> Self {
        Update {
            category,
            code,
            body,
        }
    }

    /// Final push message as it goes to the wire
    pub fn into_message(self) -> Message {
        let mut msg = self.body;
        msg.code = self.category.push_command();
        msg.id = 0;
        msg.set_u32(crate::protocol::field::NOTIFY_CODE, self.code);
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::field;

    #[test]
    fn test_category_round_trip() {
        for c in [
            Category::ObjectChange,
            Category::AlarmChange,
            Category::EventLog,
            Category::SyslogRecord,
            Category::AuditRecord,
        ] {
            assert_eq!(Category::from_u32(c.as_u32()), Some(c));
        }
        assert_eq!(Category::from_u32(0), None);
        assert_eq!(Category::from_u32(99), None);
    }

    #[test]
    fn test_update_into_message() {
        let mut body = Message::new(0, 77);
        body.set_str(field::MESSAGE_TEXT, "node down");
        let msg = Update::new(Category::AlarmChange, 4, body).into_message();
        assert_eq!(msg.code, command::ALARM_UPDATE);
        assert_eq!(msg.id, 0);
        assert_eq!(msg.get_u32(field::NOTIFY_CODE), Some(4));
        assert_eq!(msg.get_str(field::MESSAGE_TEXT), Some("node down"));
    }
}
