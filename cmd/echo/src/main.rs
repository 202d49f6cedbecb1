//! TCP echo server on the strand runtime.
//!
//! One coroutine accepts, one coroutine per connection echoes. Every
//! socket call below looks blocking but only parks its coroutine; the
//! worker threads keep serving other connections.
//!
//! ```text
//! STRAND_ECHO_PORT=9900 strand-echo
//! printf 'hello\n' | nc 127.0.0.1 9900
//! ```

use std::mem;

use anyhow::{bail, Context, Result};
use strand::{env_get, hook, IoManager, Task};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let port: u16 = env_get("STRAND_ECHO_PORT", 9900);
    let workers: usize = env_get("STRAND_ECHO_WORKERS", 4);

    let iom = IoManager::new(workers, false, "echo");
    iom.schedule(Task::call(move || {
        if let Err(err) = serve(port) {
            tracing::error!(%err, "accept loop failed");
        }
    }));
    tracing::info!(port, workers, "echo server up");

    // The runtime owns all the work; this thread just waits.
    loop {
        std::thread::park();
    }
}

fn serve(port: u16) -> Result<()> {
    let listener = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    if listener < 0 {
        bail!("socket: {}", std::io::Error::last_os_error());
    }

    let one: libc::c_int = 1;
    // SAFETY: valid fd and option storage.
    unsafe {
        libc::setsockopt(
            listener,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    // SAFETY: addr outlives the calls; sizes are correct.
    let rt = unsafe {
        libc::bind(
            listener,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rt != 0 {
        bail!("bind: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::listen(listener, 128) } != 0 {
        bail!("listen: {}", std::io::Error::last_os_error());
    }

    let iom = IoManager::current().context("accept loop outside the runtime")?;
    loop {
        // SAFETY: null addr out-params are allowed.
        let conn = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if conn < 0 {
            tracing::warn!(err = %std::io::Error::last_os_error(), "accept failed");
            continue;
        }
        tracing::debug!(conn, "connection accepted");
        iom.schedule(Task::call(move || echo(conn)));
    }
}

fn echo(conn: libc::c_int) {
    let mut buf = [0u8; 4096];
    loop {
        // SAFETY: buf is valid for its full length.
        let n = unsafe { hook::recv(conn, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n <= 0 {
            // 0 is peer close; negative is a real error.
            if n < 0 {
                tracing::debug!(conn, err = %std::io::Error::last_os_error(), "recv failed");
            }
            break;
        }
        // SAFETY: the first n bytes of buf are initialized.
        let m = unsafe {
            hook::send_all(conn, buf.as_ptr() as *const libc::c_void, n as usize)
        };
        if m < n {
            tracing::debug!(conn, err = %std::io::Error::last_os_error(), "send failed");
            hook::close(conn);
            return;
        }
    }
    hook::close(conn);
}
