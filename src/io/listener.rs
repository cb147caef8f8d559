// src/io/listener.rs
//
// Inbound stream socket plus the registry that keeps two relays from
// serving the same port. A new instance evicts whoever holds its port and
// waits for it to let go before binding.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::core::error::RelayError;
use crate::core::lock::{lock_mutex, wait_condvar_timeout};

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct RegistryInner {
    ports: Mutex<HashMap<u16, Arc<AtomicBool>>>,
    released: Condvar,
}

/// Port ownership shared by every relay in the process.
#[derive(Clone, Default)]
pub struct PortRegistry {
    inner: Arc<RegistryInner>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes `port`, evicting the current holder. `wait` bounds how long the
    /// holder gets to go away; `None` waits indefinitely.
    pub fn claim(&self, port: u16, wait: Option<Duration>) -> Result<PortClaim, RelayError> {
        let started = Instant::now();
        let mut ports = lock_mutex(&self.inner.ports, "listener.registry.claim");

        while let Some(holder) = ports.get(&port) {
            if !holder.swap(true, Ordering::SeqCst) {
                info!("[listener] evicting previous instance on port {}", port);
            }
            if let Some(limit) = wait {
                if started.elapsed() >= limit {
                    return Err(RelayError::PortBusy {
                        port,
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
            ports = wait_condvar_timeout(
                &self.inner.released,
                ports,
                POLL_INTERVAL,
                "listener.registry.claim",
            );
        }

        let evicted = Arc::new(AtomicBool::new(false));
        ports.insert(port, evicted.clone());
        debug!("[listener] claimed port {}", port);

        Ok(PortClaim {
            registry: self.clone(),
            port,
            evicted,
        })
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        lock_mutex(&self.inner.ports, "listener.registry.is_claimed").contains_key(&port)
    }
}

/// Registration of one instance on a port; released on drop.
pub struct PortClaim {
    registry: PortRegistry,
    port: u16,
    evicted: Arc<AtomicBool>,
}

impl PortClaim {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// A newer instance asked for this port.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    pub fn eviction_flag(&self) -> Arc<AtomicBool> {
        self.evicted.clone()
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        let mut ports = lock_mutex(&self.registry.inner.ports, "listener.registry.release");
        if ports
            .get(&self.port)
            .is_some_and(|holder| Arc::ptr_eq(holder, &self.evicted))
        {
            ports.remove(&self.port);
        }
        drop(ports);
        self.registry.inner.released.notify_all();
    }
}

pub struct StreamListener {
    listener: TcpListener,
    port: u16,
}

impl StreamListener {
    pub fn bind(port: u16) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|source| RelayError::Listener { port, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| RelayError::Listener { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| RelayError::Listener { port, source })?
            .port();
        info!("[listener] waiting for stream on port {}", port);
        Ok(Self { listener, port })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Waits for the single stream connection. `None` when `stop` is raised
    /// or a newer instance evicts `claim` first.
    pub fn accept(
        &self,
        claim: &PortClaim,
        stop: &AtomicBool,
    ) -> Result<Option<(TcpStream, SocketAddr)>, RelayError> {
        while !stop.load(Ordering::SeqCst) && !claim.is_evicted() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream
                        .set_nonblocking(false)
                        .map_err(|source| RelayError::Listener {
                            port: self.port,
                            source,
                        })?;
                    info!("[listener] stream connected from {}", peer);
                    return Ok(Some((stream, peer)));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(source) => {
                    return Err(RelayError::Listener {
                        port: self.port,
                        source,
                    });
                }
            }
        }
        debug!("[listener] accept on port {} abandoned", self.port);
        Ok(None)
    }
}
