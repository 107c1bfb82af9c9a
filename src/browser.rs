#![cfg(target_arch = "wasm32")]

use std::rc::Rc;

use crate::focus::Teardown;

pub(crate) mod js_event;

use js_event::JsEvent;

/// Whether the document is visible; true when there is no document at all
pub(crate) fn is_document_visible() -> bool {
    web_sys::window()
        .and_then(|window| window.document())
        .map_or(true, |document| {
            document.visibility_state() != web_sys::VisibilityState::Hidden
        })
}

/// Default focus source: re-derives from the document on `visibilitychange`
pub(crate) fn focus_event_source(notify: Rc<dyn Fn(Option<bool>)>) -> Option<Teardown> {
    let event = JsEvent::new("visibilitychange", move |_| notify(None));
    Some(Box::new(move || drop(event)))
}

/// Default connectivity source: `online`/`offline` window events
pub(crate) fn online_event_source(notify: Rc<dyn Fn(bool)>) -> Option<Teardown> {
    let online = JsEvent::new("online", {
        let notify = Rc::clone(&notify);
        move |_| notify(true)
    });
    let offline = JsEvent::new("offline", move |_| notify(false));
    Some(Box::new(move || {
        drop(online);
        drop(offline);
    }))
}
