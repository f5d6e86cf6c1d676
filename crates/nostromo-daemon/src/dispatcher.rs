//! Delivery of due actions
//!
//! Called by the scheduler loop for each action as it comes due. Remote
//! actions go to the peer when one is connected; everything else, and any
//! remote action whose send fails, is injected locally.

use std::sync::Arc;

use nostromo_config::StrokeKind;

use crate::injector::Injector;
use crate::remote::RemoteLink;
use crate::resolver::KeyMapResolver;
use crate::scheduler::{Payload, ScheduledAction};

pub struct Dispatcher {
    injector: Arc<dyn Injector>,
    link: Arc<RemoteLink>,
    resolver: Arc<KeyMapResolver>,
}

impl Dispatcher {
    pub fn new(
        injector: Arc<dyn Injector>,
        link: Arc<RemoteLink>,
        resolver: Arc<KeyMapResolver>,
    ) -> Self {
        Self {
            injector,
            link,
            resolver,
        }
    }

    pub async fn dispatch(&self, action: ScheduledAction) {
        match action.payload {
            Payload::Inject {
                kind,
                code,
                pressed,
                remote,
            } => {
                if remote && self.link.is_connected() {
                    if self.link.send(kind, code, pressed).await {
                        return;
                    }
                    tracing::debug!("Remote send failed, injecting {:?} {} locally", kind, code);
                }
                self.inject_local(kind, code, pressed);
            }
            Payload::Repeat { key, group } => {
                self.resolver.repeat(key, group);
            }
        }
    }

    fn inject_local(&self, kind: StrokeKind, code: u16, pressed: bool) {
        if let Err(e) = self.injector.inject(kind, code, pressed) {
            tracing::warn!("Local injection failed: {:#}", e);
        }
    }
}
