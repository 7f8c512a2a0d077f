use std::collections::HashMap;

use rtmq_wire::is_ctrl;
use tracing::debug;

use crate::error::RtmqError;

/// Worker callback: `(msg_type, orig_node, body)`. State the C version
/// carried as a `user_param` pointer is captured by the closure.
pub type Handler = Box<dyn Fn(u16, u32, &[u8]) + Send + Sync>;

/// message-type → handler. Populated before `launch`, read-only afterwards.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    map: HashMap<u16, Handler>,
}

impl HandlerRegistry {
    pub fn register(&mut self, msg_type: u16, handler: Handler) -> Result<(), RtmqError> {
        if is_ctrl(msg_type) {
            return Err(RtmqError::Config("message type is in the reserved control range"));
        }
        if self.map.contains_key(&msg_type) {
            return Err(RtmqError::DupRegister(msg_type));
        }
        self.map.insert(msg_type, handler);
        Ok(())
    }

    pub fn dispatch(&self, msg_type: u16, orig: u32, body: &[u8]) {
        match self.map.get(&msg_type) {
            Some(handler) => handler(msg_type, orig, body),
            None => debug!(msg_type, orig, len = body.len(), "no handler, dropping on default"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use super::*;

    #[test]
    fn duplicate_registration_rejected() {
        let mut reg = HandlerRegistry::default();
        reg.register(100, Box::new(|_, _, _| {})).unwrap();
        assert!(matches!(
            reg.register(100, Box::new(|_, _, _| {})),
            Err(RtmqError::DupRegister(100))
        ));
        // A different type still registers fine.
        reg.register(101, Box::new(|_, _, _| {})).unwrap();
    }

    #[test]
    fn control_range_rejected() {
        let mut reg = HandlerRegistry::default();
        assert!(matches!(reg.register(1, Box::new(|_, _, _| {})), Err(RtmqError::Config(_))));
    }

    #[test]
    fn unknown_type_hits_default() {
        let reg = HandlerRegistry::default();
        // Must not panic; the default handler is a logged no-op.
        reg.dispatch(999, 17, b"payload");
    }

    #[test]
    fn dispatch_passes_arguments_through() {
        let seen = Arc::new(AtomicU64::new(0));
        let mut reg = HandlerRegistry::default();
        let s = Arc::clone(&seen);
        reg.register(
            100,
            Box::new(move |t, orig, body| {
                assert_eq!((t, orig, body), (100, 17, b"hi".as_slice()));
                s.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();
        reg.dispatch(100, 17, b"hi");
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }
}
