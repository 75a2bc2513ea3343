//! Browser driver for a [`Session`]: `web_sys::WebSocket` plus gloo timeouts.
//!
//! Socket and timer callbacks hold a weak reference to the driver and feed
//! their events straight into the session. Listeners are invoked only after
//! the session borrow is released, so they may call back into the driver.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use gloo_timers::callback::Timeout;
use voice_session::session::ABNORMAL_CLOSURE;
use voice_session::{
    Command, Frame, FrameCodec, Session, SessionError, SessionState, SocketId, TimerId,
    TransportEvent,
};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{CloseEvent, MessageEvent, WebSocket};

struct Socket {
    ws: WebSocket,
    _onopen: Closure<dyn FnMut()>,
    _onmessage: Closure<dyn FnMut(MessageEvent)>,
    _onerror: Closure<dyn FnMut()>,
    _onclose: Closure<dyn FnMut(CloseEvent)>,
}

impl Socket {
    fn detach(&self) {
        self.ws.set_onopen(None);
        self.ws.set_onmessage(None);
        self.ws.set_onerror(None);
        self.ws.set_onclose(None);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.detach();
    }
}

/// The most recently finished socket or fired timer. Its callback may still
/// be on the stack, so it is kept until the next one replaces it.
struct Retired<T>(Option<T>);

impl<T> Retired<T> {
    fn new() -> Self {
        Self(None)
    }

    fn retire(&mut self, item: T) {
        self.0 = Some(item);
    }

    fn clear(&mut self) {
        self.0 = None;
    }
}

struct Inner<C: FrameCodec> {
    session: Session<C>,
    sockets: HashMap<SocketId, Socket>,
    timers: HashMap<TimerId, Timeout>,
    retired_socket: Retired<Socket>,
    retired_timer: Retired<Timeout>,
    last_state: SessionState,
    on_entry: Rc<dyn Fn(C::Inbound)>,
    on_state: Rc<dyn Fn(SessionState)>,
}

pub struct BrowserDriver<C: FrameCodec + 'static> {
    inner: Rc<RefCell<Inner<C>>>,
}

impl<C: FrameCodec + 'static> Clone for BrowserDriver<C> {
    fn clone(&self) -> Self {
        Self { inner: Rc::clone(&self.inner) }
    }
}

impl<C: FrameCodec + 'static> BrowserDriver<C> {
    pub fn new(
        session: Session<C>,
        on_entry: impl Fn(C::Inbound) + 'static,
        on_state: impl Fn(SessionState) + 'static,
    ) -> Self {
        let last_state = session.state();
        let inner = Inner {
            session,
            sockets: HashMap::new(),
            timers: HashMap::new(),
            retired_socket: Retired::new(),
            retired_timer: Retired::new(),
            last_state,
            on_entry: Rc::new(on_entry),
            on_state: Rc::new(on_state),
        };
        Self { inner: Rc::new(RefCell::new(inner)) }
    }

    pub fn state(&self) -> SessionState {
        self.inner.borrow().session.state()
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.borrow().session.user_id().map(str::to_string)
    }

    pub fn connect(&self) -> Result<(), SessionError> {
        self.control(|s| s.connect())
    }

    pub fn disconnect(&self) {
        self.control(|s| s.disconnect())
    }

    pub fn send(&self, event: &C::Outbound) -> Result<(), SessionError> {
        self.control(|s| s.send(event))
    }

    pub fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
        self.control(|s| s.send_frame(frame))
    }

    pub fn reconnect_after(&self, delay: Duration) -> Result<(), SessionError> {
        self.control(|s| s.reconnect_after(delay))
    }

    pub fn set_user_id(&self, user_id: Option<String>) -> Result<(), SessionError> {
        self.control(|s| s.set_user_id(user_id))
    }

    pub fn clear_log(&self) {
        self.control(|s| s.clear_log())
    }

    fn control<T>(&self, f: impl FnOnce(&mut Session<C>) -> T) -> T {
        let result = f(&mut self.inner.borrow_mut().session);
        flush(&self.inner);
        result
    }
}

/// Executes pending commands, then notifies listeners outside the borrow.
fn flush<C: FrameCodec + 'static>(inner: &Rc<RefCell<Inner<C>>>) {
    let weak = Rc::downgrade(inner);
    let (entries, changed, on_entry, on_state) = {
        let mut this = inner.borrow_mut();
        while let Some(command) = this.session.poll_command() {
            this.execute(command, &weak);
        }
        let entries = this.session.take_entries();
        let state = this.session.state();
        let changed = (state != this.last_state).then_some(state);
        this.last_state = state;
        (entries, changed, Rc::clone(&this.on_entry), Rc::clone(&this.on_state))
    };

    for entry in entries {
        on_entry(entry);
    }
    if let Some(state) = changed {
        on_state(state);
    }
}

fn deliver<C: FrameCodec + 'static>(weak: &Weak<RefCell<Inner<C>>>, socket: SocketId, event: TransportEvent) {
    let Some(inner) = weak.upgrade() else { return };
    {
        let mut this = inner.borrow_mut();
        if matches!(event, TransportEvent::Opened) {
            this.retired_socket.clear();
            this.retired_timer.clear();
        }
        if matches!(event, TransportEvent::Closed { .. }) {
            if let Some(finished) = this.sockets.remove(&socket) {
                finished.detach();
                this.retired_socket.retire(finished);
            }
        }
        this.session.handle_transport(socket, event);
    }
    flush(&inner);
}

impl<C: FrameCodec + 'static> Inner<C> {
    fn execute(&mut self, command: Command, weak: &Weak<RefCell<Inner<C>>>) {
        match command {
            Command::Open { socket, url } => match open_socket(socket, url.as_str(), weak) {
                Ok(opened) => {
                    self.sockets.insert(socket, opened);
                }
                Err(e) => {
                    let detail = format!("{e:?}");
                    log::error!("Failed to create WebSocket for {url}: {detail}");
                    self.session.handle_transport(socket, TransportEvent::Error(detail));
                    self.session.handle_transport(
                        socket,
                        TransportEvent::Closed { code: ABNORMAL_CLOSURE, reason: String::new() },
                    );
                }
            },
            Command::Send { socket, frame } => {
                let Some(target) = self.sockets.get(&socket) else { return };
                let sent = match frame {
                    Frame::Text(text) => target.ws.send_with_str(&text),
                    Frame::Binary(bytes) => target.ws.send_with_u8_array(&bytes),
                };
                if let Err(e) = sent {
                    log::warn!("WebSocket send failed: {e:?}");
                }
            }
            Command::Close { socket, code, reason } => {
                if let Some(target) = self.sockets.get(&socket) {
                    let _ = target.ws.close_with_code_and_reason(code, &reason);
                }
            }
            Command::StartTimer { timer, delay } => {
                let weak = weak.clone();
                let millis = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
                let timeout = Timeout::new(millis, move || {
                    let Some(inner) = weak.upgrade() else { return };
                    {
                        let mut this = inner.borrow_mut();
                        if let Some(fired) = this.timers.remove(&timer) {
                            this.retired_timer.retire(fired);
                        }
                        this.session.handle_timer(timer);
                    }
                    flush(&inner);
                });
                // Dropping a replaced timeout cancels it.
                self.timers.insert(timer, timeout);
            }
            Command::CancelTimer { timer } => {
                self.timers.remove(&timer);
            }
        }
    }
}

fn open_socket<C: FrameCodec + 'static>(
    socket: SocketId,
    url: &str,
    weak: &Weak<RefCell<Inner<C>>>,
) -> Result<Socket, JsValue> {
    let ws = WebSocket::new(url)?;
    ws.set_binary_type(web_sys::BinaryType::Arraybuffer);

    let w = weak.clone();
    let onopen = Closure::<dyn FnMut()>::new(move || deliver(&w, socket, TransportEvent::Opened));
    ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));

    let w = weak.clone();
    let onmessage = Closure::<dyn FnMut(MessageEvent)>::new(move |ev: MessageEvent| {
        let data = ev.data();
        let frame = match data.as_string() {
            Some(text) => Frame::Text(text),
            None => Frame::Binary(js_sys::Uint8Array::new(&data).to_vec()),
        };
        deliver(&w, socket, TransportEvent::Frame(frame));
    });
    ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));

    let w = weak.clone();
    let onerror = Closure::<dyn FnMut()>::new(move || {
        log::error!("WebSocket connection error on {socket}");
        deliver(&w, socket, TransportEvent::Error(String::new()));
    });
    ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));

    let w = weak.clone();
    let onclose = Closure::<dyn FnMut(CloseEvent)>::new(move |ev: CloseEvent| {
        deliver(&w, socket, TransportEvent::Closed { code: ev.code(), reason: ev.reason() });
    });
    ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));

    Ok(Socket { ws, _onopen: onopen, _onmessage: onmessage, _onerror: onerror, _onclose: onclose })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Tracked(Rc<Cell<usize>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_retired_keeps_only_the_latest() {
        let dropped = Rc::new(Cell::new(0));
        let mut retired = Retired::new();
        for _ in 0..100 {
            retired.retire(Tracked(Rc::clone(&dropped)));
        }
        assert_eq!(dropped.get(), 99);
        assert!(retired.0.is_some());

        retired.clear();
        assert_eq!(dropped.get(), 100);
    }
}
