use anyhow::Result;
use creepflow_core::{
    BaseFlowField, CreepData, FlowField, GridRect, JumpDrive, MovementConfig, MovementWorld,
    Portal, SharedStats,
};
use glam::{IVec2, Vec2};
use tracing::info;

fn main() -> Result<()> {
    init_tracing();
    let mut world = bootstrap_world()?;
    info!("Starting creepflow movement demo");

    let ticks: usize = std::env::var("CF_TICKS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1800);
    let report_every = 60;

    let mut kills = 0usize;
    let mut teleports = 0usize;
    for step in 0..ticks {
        let events = world.step();
        kills += events.kill_or_damage.len();
        teleports += events.portal_uses.len();
        if (step + 1) % report_every == 0 {
            info!(
                tick = events.tick.0,
                creeps = world.creep_count(),
                kills,
                teleports,
                "tick summary",
            );
        }
        // External removal of killed creeps.
        for event in &events.kill_or_damage {
            if event.impact_speed == f32::MAX {
                world.remove_creep(event.creep);
            }
        }
    }

    info!(
        ticks,
        survivors = world.creep_count(),
        kills,
        teleports,
        "Demo run complete",
    );
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Walled arena with a mud strip, one powered portal, and a mixed creep wave.
fn bootstrap_world() -> Result<MovementWorld> {
    let width = 48;
    let height = 48;
    let seed = std::env::var("CF_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0xFACA_DEAF_0123_4567_u64);
    let config = MovementConfig {
        width,
        height,
        rng_seed: Some(seed),
        ..MovementConfig::default()
    };

    let mut base = BaseFlowField::new(width, height, 1.0)?;
    for i in 0..width as i32 {
        if let Some(cell) = base.get_mut(i, 0) {
            cell.is_wall = true;
        }
        if let Some(cell) = base.get_mut(i, height as i32 - 1) {
            cell.is_wall = true;
        }
    }
    for i in 0..height as i32 {
        if let Some(cell) = base.get_mut(0, i) {
            cell.is_wall = true;
        }
        if let Some(cell) = base.get_mut(width as i32 - 1, i) {
            cell.is_wall = true;
        }
    }
    for y in 1..height as i32 - 1 {
        if let Some(cell) = base.get_mut(24, y) {
            cell.move_speed_modifier = 0.4;
        }
    }

    let field_in = FlowField::uniform(width, height, Vec2::X)?;
    let field_out = FlowField::uniform(width, height, -Vec2::X)?;
    let mut world = MovementWorld::new(config, base, field_in, field_out)?;

    world.set_portals(vec![Portal {
        cell: Vec2::new(36.0, 24.0),
        radius: 1.5,
        exit_area: GridRect::new(IVec2::new(4, 4), IVec2::new(8, 8)),
        is_powered: true,
    }]);

    let runner = world.register_stats(SharedStats {
        speed: 3.0,
        collision_range: 0.2,
        neighbor_range: 1.2,
        max_force: 5.0,
    });
    let tank = world.register_stats(SharedStats {
        speed: 1.2,
        collision_range: 0.45,
        neighbor_range: 1.0,
        max_force: 3.0,
    });

    for row in 0..12 {
        let y = 4.0 + row as f32 * 3.5;
        for col in 0..4 {
            let x = 2.5 + col as f32 * 1.5;
            world.spawn_creep(CreepData {
                position: Vec2::new(x, y),
                stats: runner,
                ..CreepData::default()
            })?;
        }
        world.spawn_creep(CreepData {
            position: Vec2::new(9.5, y),
            mass: 4.0,
            stats: tank,
            ..CreepData::default()
        })?;
        let jumper = world.spawn_creep(CreepData {
            position: Vec2::new(11.5, y),
            stats: runner,
            ..CreepData::default()
        })?;
        if let Some(runtime) = world.creep_runtime_mut(jumper) {
            runtime.jump = Some(JumpDrive::new(0.75, 1, 3));
        }
    }

    info!(
        creeps = world.creep_count(),
        width, height, seed, "World bootstrapped",
    );
    Ok(world)
}
