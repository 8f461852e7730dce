use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tracing_subscriber::EnvFilter;
use wl_client::{
    Context, DecodeMessageError, Dispatch, Event, Listeners, MessageEncoder, Object, ObjectId,
    Proxy,
};

#[derive(Debug, Clone)]
struct Global {
    name: u32,
    interface: String,
    version: u32,
}

#[derive(Default)]
struct Display {
    proxy: Proxy,
}

impl Object for Display {
    fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    fn interface(&self) -> &'static str {
        "wl_display"
    }
}

impl Dispatch for Display {
    fn dispatch(&self, ctx: &Context, event: &mut Event) -> Result<(), DecodeMessageError> {
        match event.opcode() {
            0 => {
                let object = event.read_object(ctx)?;
                let code = event.read_u32()?;
                let message = event.read_string()?;
                tracing::error!(
                    object = ?object.and_then(|object| object.id()),
                    code,
                    message,
                    "protocol error"
                );
                ctx.close();
            }
            1 => {
                let id = event.read_u32()?;
                ctx.unregister_id(id);
            }
            opcode => {
                return Err(DecodeMessageError::UnknownOpcode {
                    interface: self.interface(),
                    opcode,
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Registry {
    proxy: Proxy,
    global: Listeners<Global>,
    global_remove: Listeners<u32>,
}

impl Object for Registry {
    fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    fn interface(&self) -> &'static str {
        "wl_registry"
    }
}

impl Dispatch for Registry {
    fn dispatch(&self, _ctx: &Context, event: &mut Event) -> Result<(), DecodeMessageError> {
        match event.opcode() {
            0 => {
                let global = Global {
                    name: event.read_u32()?,
                    interface: event.read_string()?,
                    version: event.read_u32()?,
                };
                self.global.emit(&global);
            }
            1 => {
                self.global_remove.emit(&event.read_u32()?);
            }
            opcode => {
                return Err(DecodeMessageError::UnknownOpcode {
                    interface: self.interface(),
                    opcode,
                });
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Callback {
    proxy: Proxy,
    done: Listeners<u32>,
}

impl Object for Callback {
    fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    fn interface(&self) -> &'static str {
        "wl_callback"
    }
}

impl Dispatch for Callback {
    fn dispatch(&self, _ctx: &Context, event: &mut Event) -> Result<(), DecodeMessageError> {
        match event.opcode() {
            0 => {
                self.done.emit(&event.read_u32()?);
                Ok(())
            }
            opcode => Err(DecodeMessageError::UnknownOpcode {
                interface: self.interface(),
                opcode,
            }),
        }
    }
}

async fn request(
    ctx: &Context,
    target: ObjectId,
    opcode: u16,
    new_id: ObjectId,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut encoder = MessageEncoder::new(target, opcode);
    encoder.write(&new_id)?;
    ctx.send(&encoder.finish()?, &[]).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let ctx = Context::connect(None)?;
    let display = Arc::new(Display::default());
    let display_id = ctx.register(display)?;

    let registry = Arc::new(Registry::default());
    registry.global.add(|global| {
        println!("{:>4} {} v{}", global.name, global.interface, global.version);
    });
    registry.global_remove.add(|name| println!("{name:>4} removed"));
    let registry_id = ctx.register(registry)?;
    request(&ctx, display_id, 1, registry_id).await?;

    let done = Arc::new(AtomicBool::new(false));
    let callback = Arc::new(Callback::default());
    callback.done.once({
        let done = done.clone();
        move |_| done.store(true, Ordering::SeqCst)
    });
    let callback_id = ctx.register(callback)?;
    request(&ctx, display_id, 0, callback_id).await?;

    while !done.load(Ordering::SeqCst) {
        ctx.dispatch().await?;
    }

    ctx.close();
    Ok(())
}
