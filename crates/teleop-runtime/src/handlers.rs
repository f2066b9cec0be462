//! Command handlers and registry assembly.
//!
//! [`Controller`] owns the collaborators (streamer, motors, display) and
//! turns them into a [`HandlerRegistry`] covering every client opcode.
//! Each handler captures the collaborator it needs as an `Arc` when the
//! registry is built.

use std::net::SocketAddr;
use std::sync::Arc;

use teleop_hal::{MotorController, StatusDisplay};
use teleop_middleware::{HandlerRegistry, LoginOutcome, Reply};
use teleop_types::{Envelope, TeleopError, commands};
use tracing::info;

use crate::streamer::Streamer;

const HANDLERS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::handlers");

/// Display row showing the server address.
pub const SERVER_ROW: usize = 0;
/// Display row showing the connected client.
pub const CLIENT_ROW: usize = 1;

/// The application collaborators behind the command handlers.
#[derive(Clone)]
pub struct Controller {
    streamer: Arc<Streamer>,
    motor: Arc<MotorController>,
    display: Arc<dyn StatusDisplay>,
}

impl Controller {
    pub fn new(
        streamer: Arc<Streamer>,
        motor: Arc<MotorController>,
        display: Arc<dyn StatusDisplay>,
    ) -> Self {
        Self {
            streamer,
            motor,
            display,
        }
    }

    pub fn streamer(&self) -> &Arc<Streamer> {
        &self.streamer
    }

    pub fn motor(&self) -> &Arc<MotorController> {
        &self.motor
    }

    pub fn display(&self) -> &Arc<dyn StatusDisplay> {
        &self.display
    }

    /// Show the listening address on the server row.
    pub fn show_server(&self, addr: SocketAddr) {
        self.display.set_row(SERVER_ROW, Some(&addr.to_string()));
    }

    /// Build the registry for every client opcode.
    ///
    /// A non-empty `password` enables the login exchange.
    pub fn registry(&self, password: &str) -> Arc<HandlerRegistry> {
        let streamer = &self.streamer;
        let motor = &self.motor;

        let mut builder = HandlerRegistry::builder()
            .on(commands::RESET, {
                let (streamer, motor) = (streamer.clone(), motor.clone());
                move |_| {
                    streamer.reset();
                    motor.reset();
                    Ok(None)
                }
            })
            .on(commands::GET_SYS_INFO, {
                let streamer = streamer.clone();
                move |_| Ok(Some(streamer.sys_info()))
            })
            .on(commands::SET_STREAM, {
                let streamer = streamer.clone();
                move |env| {
                    streamer.set_stream(env.get_bool("STREAM").unwrap_or(false));
                    Ok(None)
                }
            })
            .on(commands::SET_INFER, {
                let streamer = streamer.clone();
                move |env| {
                    streamer.set_infer(env.get_bool("INFER").unwrap_or(false));
                    Ok(None)
                }
            })
            .on(commands::SET_QUALITY, {
                let streamer = streamer.clone();
                move |env| set_quality(&streamer, env)
            })
            .on(commands::SET_RESOLUTION, {
                let streamer = streamer.clone();
                move |env| set_quality(&streamer, env)
            })
            .on(commands::GET_CONFIGS, {
                let streamer = streamer.clone();
                move |_| Ok(Some(commands::configs(&streamer.configs())))
            })
            .on(commands::GET_CONFIG, {
                let streamer = streamer.clone();
                move |_| Ok(Some(commands::config(streamer.config().as_ref())))
            })
            .on(commands::SET_CONFIG, {
                let streamer = streamer.clone();
                move |env| {
                    let name = env
                        .get_str("CONFIG")
                        .ok_or_else(|| TeleopError::handler(env.cmd(), "missing CONFIG"))?;
                    streamer
                        .set_config(name)
                        .map_err(|e| TeleopError::handler(env.cmd(), e.to_string()))?;
                    Ok(None)
                }
            })
            .on(commands::MOV, {
                let motor = motor.clone();
                move |env| mov(&motor, env)
            })
            .on_enter_with_peer({
                let display = self.display.clone();
                move |peer| {
                    display.set_row(CLIENT_ROW, Some(&peer.to_string()));
                    Ok(None)
                }
            })
            .on_exit_with_peer({
                let (streamer, display) = (streamer.clone(), self.display.clone());
                move |peer| {
                    streamer.reset();
                    display.set_row(CLIENT_ROW, None);
                    info!(target: HANDLERS_TARGET, %peer, "client disconnected");
                    Ok(None)
                }
            })
            .routine({
                let streamer = streamer.clone();
                move || streamer.next_frame()
            });

        if !password.is_empty() {
            let password = password.to_string();
            builder = builder.login(move |env, peer| {
                let verified = env.cmd() == commands::LOGIN
                    && env.get_str("PWD") == Some(password.as_str());
                info!(target: HANDLERS_TARGET, %peer, verified, "login attempt");
                LoginOutcome {
                    reply: commands::login_info(verified),
                    verified,
                }
            });
        }
        builder.build()
    }
}

fn set_quality(streamer: &Streamer, env: &Envelope) -> Reply {
    let side = |key: &str| {
        env.get_i64(key)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    let (width, height) = (side("WIDTH"), side("HEIGHT"));
    info!(target: HANDLERS_TARGET, width, height, "set quality");
    streamer
        .set_quality(width, height)
        .map_err(|e| TeleopError::handler(env.cmd(), e.to_string()))?;
    Ok(None)
}

/// `MOV`: `R` defaults to 0 and `THETA` to the neutral heading.
fn mov(motor: &MotorController, env: &Envelope) -> Reply {
    let number = |key: &str, default: f64| match env.get(key) {
        None => Ok(default),
        Some(_) => env
            .get_f64(key)
            .ok_or_else(|| TeleopError::handler(env.cmd(), format!("{key} is not a number"))),
    };
    let r = number("R", 0.0)?;
    let theta = number("THETA", motor.geometry().neutral_angle)?;
    motor.set(r, theta)?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::Value;
    use teleop_hal::motor::DriveGeometry;
    use teleop_hal::pwm::PwmPin;
    use teleop_hal::sim::{MemoryDisplay, SimCamera, SimDetector, SimPin};
    use teleop_middleware::codec;
    use teleop_middleware::{Listener, ListenerConfig};

    use crate::streamer::StreamerConfig;

    struct Rig {
        controller: Controller,
        display: Arc<MemoryDisplay>,
    }

    fn rig() -> Rig {
        let pins: [Arc<dyn PwmPin>; 3] = [
            Arc::new(SimPin::new(32)),
            Arc::new(SimPin::new(35)),
            Arc::new(SimPin::new(33)),
        ];
        let motor = MotorController::new(pins, DriveGeometry::default()).unwrap();
        let streamer = Streamer::new(
            Box::new(SimCamera::new("front", 640, 480)),
            Box::new(SimDetector::new(["yolov4-tiny-416"])),
            StreamerConfig {
                max_fps: 0,
                idle_interval: Duration::from_millis(5),
            },
        );
        let display = Arc::new(MemoryDisplay::new(2));
        Rig {
            controller: Controller::new(Arc::new(streamer), Arc::new(motor), display.clone()),
            display,
        }
    }

    fn peer() -> SocketAddr {
        "192.168.1.20:50000".parse().unwrap()
    }

    fn call(registry: &HandlerRegistry, env: Envelope) -> Reply {
        registry.dispatch(&env, peer()).expect("opcode registered")
    }

    #[test]
    fn every_client_opcode_is_registered() {
        let registry = rig().controller.registry("");
        for cmd in [
            commands::RESET,
            commands::GET_SYS_INFO,
            commands::SET_STREAM,
            commands::SET_INFER,
            commands::SET_QUALITY,
            commands::SET_RESOLUTION,
            commands::SET_CONFIG,
            commands::GET_CONFIG,
            commands::GET_CONFIGS,
            commands::MOV,
        ] {
            assert!(registry.is_registered(cmd), "{cmd} missing");
        }
        assert!(!registry.has_login());
        assert_eq!(registry.routines().len(), 1);
    }

    #[test]
    fn mov_sets_duties_with_defaults() {
        let rig = rig();
        let registry = rig.controller.registry("");
        call(&registry, Envelope::new(commands::MOV).with("R", 0.5).with("THETA", 90)).unwrap();
        let d = rig.controller.motor().duties();
        assert_eq!((d.left, d.right, d.angle), (50.0, 50.0, 50.0));

        call(&registry, Envelope::new(commands::MOV)).unwrap();
        let d = rig.controller.motor().duties();
        assert_eq!((d.left, d.right), (0.0, 0.0));
        assert!(call(&registry, Envelope::new(commands::MOV).with("R", "fast")).is_err());
    }

    #[test]
    fn stream_flags_round_trip_through_sys_info() {
        let registry = rig().controller.registry("");
        call(&registry, Envelope::new(commands::SET_STREAM).with("STREAM", true)).unwrap();
        call(&registry, Envelope::new(commands::SET_INFER).with("INFER", true)).unwrap();
        let info = call(&registry, Envelope::new(commands::GET_SYS_INFO)).unwrap().unwrap();
        assert_eq!(info.get_bool("IS_STREAM"), Some(true));
        assert_eq!(info.get_bool("IS_INFER"), Some(true));

        call(&registry, Envelope::new(commands::RESET)).unwrap();
        let info = call(&registry, Envelope::new(commands::GET_SYS_INFO)).unwrap().unwrap();
        assert_eq!(info.get_bool("IS_STREAM"), Some(false));
    }

    #[test]
    fn quality_outside_range_is_refused() {
        let registry = rig().controller.registry("");
        let bad = Envelope::new(commands::SET_QUALITY).with("WIDTH", 50).with("HEIGHT", 480);
        assert!(matches!(call(&registry, bad), Err(TeleopError::HandlerFault { .. })));
        let ok = Envelope::new(commands::SET_RESOLUTION).with("WIDTH", 1280).with("HEIGHT", 720);
        call(&registry, ok).unwrap();
        let info = call(&registry, Envelope::new(commands::GET_SYS_INFO)).unwrap().unwrap();
        assert_eq!(info.get_i64("CAMERA_WIDTH"), Some(1280));
        assert_eq!(info.get_i64("CAMERA_HEIGHT"), Some(720));
    }

    #[test]
    fn detector_configs_are_listed_and_loaded() {
        let registry = rig().controller.registry("");
        let none = call(&registry, Envelope::new(commands::GET_CONFIG)).unwrap().unwrap();
        assert!(none.get("CONFIG_NAME").unwrap().is_null());

        let all = call(&registry, Envelope::new(commands::GET_CONFIGS)).unwrap().unwrap();
        let map = all.get("CONFIGS").and_then(Value::as_object).unwrap();
        assert!(map.contains_key("yolov4-tiny-416"));

        assert!(call(&registry, Envelope::new(commands::SET_CONFIG)).is_err());
        call(
            &registry,
            Envelope::new(commands::SET_CONFIG).with("CONFIG", "yolov4-tiny-416"),
        )
        .unwrap();
        let active = call(&registry, Envelope::new(commands::GET_CONFIG)).unwrap().unwrap();
        assert_eq!(active.get_str("CONFIG_NAME"), Some("yolov4-tiny-416"));
        assert_eq!(active.get_bool("TINY"), Some(true));
    }

    #[test]
    fn enter_and_exit_update_the_client_row() {
        let rig = rig();
        let registry = rig.controller.registry("");
        rig.controller.streamer().set_stream(true);
        registry.enter_hooks()[0].call(peer()).unwrap();
        assert_eq!(rig.display.row(CLIENT_ROW).as_deref(), Some("192.168.1.20:50000"));
        registry.exit_hooks()[0].call(peer()).unwrap();
        assert_eq!(rig.display.row(CLIENT_ROW), None);
        assert!(!rig.controller.streamer().is_stream());
    }

    #[test]
    fn login_checks_the_password() {
        let registry = rig().controller.registry("hunter2");
        let ok = registry
            .login(&Envelope::new(commands::LOGIN).with("PWD", "hunter2"), peer())
            .unwrap();
        assert!(ok.verified);
        assert_eq!(ok.reply.cmd(), commands::LOG_INFO);
        let bad = registry
            .login(&Envelope::new(commands::LOGIN).with("PWD", "guess"), peer())
            .unwrap();
        assert!(!bad.verified);
        assert_eq!(bad.reply.get_bool("VERIFY"), Some(false));
    }

    #[test]
    fn end_to_end_move_then_watchdog_reset() {
        let rig = rig();
        let geometry = DriveGeometry {
            reset_interval: Duration::from_millis(200),
            watchdog_tick: Duration::from_millis(20),
            ..DriveGeometry::default()
        };
        let pins: [Arc<dyn PwmPin>; 3] = [
            Arc::new(SimPin::new(1)),
            Arc::new(SimPin::new(2)),
            Arc::new(SimPin::new(3)),
        ];
        let motor = Arc::new(MotorController::new(pins, geometry).unwrap());
        motor.start(None).unwrap();
        let controller = Controller::new(
            rig.controller.streamer().clone(),
            motor.clone(),
            rig.display.clone(),
        );

        let config = ListenerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ListenerConfig::default()
        };
        let listener = Listener::bind(config, controller.registry("")).unwrap();
        listener.start().unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        codec::send(
            &mut client,
            &Envelope::new(commands::MOV).with("R", 0.5).with("THETA", 90),
        )
        .unwrap();
        codec::send(&mut client, &Envelope::new(commands::GET_SYS_INFO)).unwrap();
        let info = codec::receive(&mut client).unwrap();
        assert_eq!(info.cmd(), commands::SYS_INFO);
        assert_eq!(motor.duties().left, 50.0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while motor.duties().left != 0.0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let d = motor.duties();
        assert_eq!((d.left, d.right, d.angle), (0.0, 0.0, 50.0));

        listener.close();
        listener.join().unwrap();
        motor.close();
    }
}
