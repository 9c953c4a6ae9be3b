//! Stepping loop: drives a robot with the gait controller over generated
//! terrain and scores how far it went.

use super::gait::{Genome, JointTable};
use super::terrain::{Obstacle, TerrainGenerator};
use super::world::{Frame, PhysicsWorld, Position, Robot, RobotSpec, ServoAxis, Visualizer};
use crate::config::SimulationConfig;
use crate::error::{SimError, SimResult};

/// Fitness of a final robot position. Travel towards -x scores positive.
pub fn fitness(position: &Position) -> f64 {
    -position.x
}

/// Number of steps `k = 0, 1, ...` with `k·step < step_limit`.
///
/// Carries a relative tolerance so that e.g. 0.1 s at 0.01 s/step is 10
/// steps despite `0.1 / 0.01` rounding above 10.
pub fn step_budget(step: f64, step_limit: f64) -> u64 {
    let ratio = step_limit / step;
    (ratio * (1.0 - 1e-12)).ceil().max(0.0) as u64
}

/// One robot in one world on one terrain.
///
/// The clock is not reset between `run` calls: repeated runs on the same
/// instance continue the gait where the previous run stopped. Use
/// `reset_clock` or a fresh instance for independent trials.
pub struct Simulation<W: PhysicsWorld> {
    config: SimulationConfig,
    world: W,
    robot: W::Robot,
    joints: JointTable,
    obstacles: Vec<Obstacle>,
    viewer: Option<Box<dyn Visualizer>>,
    terrain_seed: u64,
    clock: f64,
    steps_taken: u64,
}

impl<W: PhysicsWorld> Simulation<W> {
    /// Spawn the robot, then lay out the terrain.
    ///
    /// `viewer` is required unless `config.headless` and ignored otherwise.
    pub fn new(
        config: SimulationConfig,
        mut world: W,
        spec: &RobotSpec,
        viewer: Option<Box<dyn Visualizer>>,
    ) -> SimResult<Self> {
        let mut robot = world.spawn_robot(spec)?;
        let joints = JointTable::mirrored(robot.servo_count())?;
        // The gait only drives the dihedral axis; twist stays centered.
        for servo in 0..robot.servo_count() {
            robot.set_angle(servo, ServoAxis::Twist, 0.0)?;
        }

        let viewer = if config.headless {
            None
        } else {
            let mut v = viewer.ok_or(SimError::MissingViewer)?;
            v.attach(spec);
            Some(v)
        };

        let mut sim = Simulation {
            config,
            world,
            robot,
            joints,
            obstacles: Vec::new(),
            viewer,
            terrain_seed: 0,
            clock: 0.0,
            steps_taken: 0,
        };
        sim.add_obstacles()?;
        Ok(sim)
    }

    fn add_obstacles(&mut self) -> SimResult<()> {
        let mut terrain = TerrainGenerator::from_seed(self.config.seed);
        self.terrain_seed = terrain.seed();

        let obstacles = terrain.generate(
            self.config.obstacle_count,
            self.config.obstacle_size,
            self.config.tilt,
        )?;
        for o in &obstacles {
            if let Some(v) = self.viewer.as_mut() {
                v.add_obstacle(o);
            }
            self.world.add_to_ground(o)?;
        }
        self.obstacles = obstacles;
        Ok(())
    }

    /// Drive the gait for `step_limit` simulated seconds and return the
    /// fitness of the final position.
    pub fn run(&mut self, params: &[f64], step: f64, step_limit: f64) -> SimResult<f64> {
        if !(step > 0.0 && step.is_finite()) {
            return Err(SimError::InvalidStep(step));
        }
        if !(step_limit >= 0.0 && step_limit.is_finite()) {
            return Err(SimError::InvalidStepLimit(step_limit));
        }
        let genome = self.joints.genome(params)?;

        let budget = step_budget(step, step_limit);
        for _ in 0..budget {
            if let Some(v) = self.viewer.as_ref() {
                if v.abort_requested() {
                    tracing::info!(clock = self.clock, "abort requested, stopping evaluation");
                    return Err(SimError::Aborted);
                }
            }
            self.procedure(&genome, step)?;
        }

        let position = self.robot.position();
        let score = fitness(&position);
        tracing::debug!(
            steps = budget,
            clock = self.clock,
            position = %position,
            fitness = score,
            "evaluation finished"
        );
        Ok(score)
    }

    fn procedure(&mut self, genome: &Genome<'_>, step: f64) -> SimResult<()> {
        self.clock += step;
        if let Some(v) = self.viewer.as_mut() {
            v.render(&Frame {
                time: self.clock,
                position: self.robot.position(),
            });
        }
        self.robot.next_step(step)?;
        self.world.next_step(&mut self.robot, step)?;

        for (servo, angle) in self.joints.commands(self.clock, genome)? {
            self.robot.set_angle(servo, ServoAxis::Dihedral, angle)?;
        }
        self.steps_taken += 1;
        Ok(())
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn reset_clock(&mut self) {
        self.clock = 0.0;
    }

    /// Steps taken over the lifetime of this instance.
    pub fn steps_taken(&self) -> u64 {
        self.steps_taken
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn terrain_seed(&self) -> u64 {
        self.terrain_seed
    }

    pub fn joints(&self) -> &JointTable {
        &self.joints
    }

    pub fn robot(&self) -> &W::Robot {
        &self.robot
    }

    pub fn world(&self) -> &W {
        &self.world
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Robot that records commands and moves at a constant velocity.
    pub struct MockRobot {
        pub angles: Vec<f64>,
        pub twist: Vec<Option<f64>>,
        pub position: Position,
        pub velocity: f64,
        pub own_steps: usize,
    }

    impl Robot for MockRobot {
        fn servo_count(&self) -> usize {
            self.angles.len()
        }

        fn set_angle(&mut self, servo: usize, axis: ServoAxis, radians: f64) -> SimResult<()> {
            let servos = self.angles.len();
            if servo >= servos {
                return Err(SimError::ServoIndex { index: servo, servos });
            }
            match axis {
                ServoAxis::Dihedral => self.angles[servo] = radians,
                ServoAxis::Twist => self.twist[servo] = Some(radians),
            }
            Ok(())
        }

        fn next_step(&mut self, _dt: f64) -> SimResult<()> {
            self.own_steps += 1;
            Ok(())
        }

        fn position(&self) -> Position {
            self.position
        }
    }

    #[derive(Default)]
    pub struct MockWorld {
        pub statics: usize,
        pub steps: usize,
        pub start: Position,
        pub velocity: f64,
        pub fail_at: Option<usize>,
    }

    impl PhysicsWorld for MockWorld {
        type Robot = MockRobot;

        fn add_to_ground(&mut self, obstacle: &Obstacle) -> SimResult<()> {
            if !obstacle.fixed {
                return Err(SimError::NotFixed);
            }
            self.statics += 1;
            Ok(())
        }

        fn static_bodies(&self) -> usize {
            self.statics
        }

        fn spawn_robot(&mut self, spec: &RobotSpec) -> SimResult<MockRobot> {
            Ok(MockRobot {
                angles: vec![0.0; spec.servos],
                twist: vec![None; spec.servos],
                position: self.start,
                velocity: self.velocity,
                own_steps: 0,
            })
        }

        fn next_step(&mut self, robot: &mut MockRobot, dt: f64) -> SimResult<()> {
            if self.fail_at == Some(self.steps) {
                return Err(SimError::Physics("solver diverged".into()));
            }
            self.steps += 1;
            robot.position.x += robot.velocity * dt;
            Ok(())
        }
    }

    #[derive(Default)]
    struct ViewerLog {
        attached: bool,
        obstacles: usize,
        frames: usize,
    }

    struct MockViewer {
        log: Rc<RefCell<ViewerLog>>,
        abort: bool,
    }

    impl Visualizer for MockViewer {
        fn attach(&mut self, _spec: &RobotSpec) {
            self.log.borrow_mut().attached = true;
        }
        fn add_obstacle(&mut self, _obstacle: &Obstacle) {
            self.log.borrow_mut().obstacles += 1;
        }
        fn render(&mut self, _frame: &Frame) {
            self.log.borrow_mut().frames += 1;
        }
        fn abort_requested(&self) -> bool {
            self.abort
        }
    }

    fn config(obstacle_count: usize) -> SimulationConfig {
        SimulationConfig {
            obstacle_count,
            seed: Some(17),
            ..SimulationConfig::default()
        }
    }

    fn headless(world: MockWorld) -> Simulation<MockWorld> {
        Simulation::new(config(10), world, &RobotSpec::quadruped(), None).unwrap()
    }

    #[test]
    fn test_fitness_sign() {
        assert_eq!(fitness(&Position::new(3.2, 1.0, 0.5)), -3.2);
        let mut sim = headless(MockWorld {
            start: Position::new(3.2, 0.0, 0.5),
            ..MockWorld::default()
        });
        let score = sim.run(&[0.5; 19], 0.01, 0.1).unwrap();
        assert_eq!(score, -3.2);
    }

    #[test]
    fn test_fitness_tracks_progress() {
        let mut sim = headless(MockWorld {
            velocity: -1.0,
            ..MockWorld::default()
        });
        let score = sim.run(&[0.5; 19], 0.01, 1.0).unwrap();
        assert!((score - 1.0).abs() < 1e-9, "score {score}");
    }

    #[test]
    fn test_step_budget() {
        assert_eq!(step_budget(0.01, 0.1), 10);
        assert_eq!(step_budget(0.008, 4.0), 500);
        assert_eq!(step_budget(0.3, 1.0), 4);
        assert_eq!(step_budget(0.01, 0.0), 0);
    }

    #[test]
    fn test_clock_accumulates_across_runs() {
        let mut sim = headless(MockWorld::default());
        sim.run(&[0.5; 19], 0.01, 0.1).unwrap();
        assert_eq!(sim.world().steps, 10);
        sim.run(&[0.5; 19], 0.01, 0.1).unwrap();
        assert_eq!(sim.world().steps, 20);
        assert!((sim.clock() - 0.2).abs() < 1e-12, "clock {}", sim.clock());

        sim.reset_clock();
        assert_eq!(sim.clock(), 0.0);
        assert_eq!(sim.steps_taken(), 20);
    }

    #[test]
    fn test_zero_limit_takes_no_steps() {
        let mut sim = headless(MockWorld {
            start: Position::new(0.7, 0.0, 0.5),
            velocity: 5.0,
            ..MockWorld::default()
        });
        let score = sim.run(&[0.5; 19], 0.01, 0.0).unwrap();
        assert_eq!(sim.world().steps, 0);
        assert_eq!(sim.robot().own_steps, 0);
        assert_eq!(score, -0.7);
        assert_eq!(sim.clock(), 0.0);
    }

    #[test]
    fn test_robot_and_world_step_together() {
        let mut sim = headless(MockWorld::default());
        sim.run(&[0.5; 19], 0.008, 0.08).unwrap();
        assert_eq!(sim.robot().own_steps, 10);
        assert_eq!(sim.world().steps, 10);
    }

    #[test]
    fn test_commands_reach_mirrored_servos() {
        let mut sim = headless(MockWorld::default());
        let genes: Vec<f64> = (0..19).map(|i| 0.05 * i as f64).collect();
        sim.run(&genes, 0.01, 0.05).unwrap();

        let angles = &sim.robot().angles;
        for i in 2..6 {
            assert_eq!(angles[i], angles[i + 4]);
        }
        // Last command was issued at clock 0.05.
        let genome = sim.joints().genome(&genes).unwrap();
        let group = genome.group(3).unwrap();
        let expected = sim.joints().groups()[3].target(sim.clock(), group, genome.frequency());
        assert_eq!(angles[3], expected);
    }

    #[test]
    fn test_preconditions() {
        let mut sim = headless(MockWorld::default());
        assert!(matches!(
            sim.run(&[0.5; 18], 0.01, 1.0),
            Err(SimError::ParameterLength { expected: 19, actual: 18 })
        ));
        assert!(matches!(sim.run(&[0.5; 19], 0.0, 1.0), Err(SimError::InvalidStep(_))));
        assert!(matches!(sim.run(&[0.5; 19], -0.1, 1.0), Err(SimError::InvalidStep(_))));
        assert!(matches!(sim.run(&[0.5; 19], f64::NAN, 1.0), Err(SimError::InvalidStep(_))));
        assert!(matches!(sim.run(&[0.5; 19], 0.01, -1.0), Err(SimError::InvalidStepLimit(_))));
        assert!(matches!(
            sim.run(&[0.5; 19], 0.01, f64::INFINITY),
            Err(SimError::InvalidStepLimit(_))
        ));
        // Nothing ran.
        assert_eq!(sim.world().steps, 0);
        assert_eq!(sim.clock(), 0.0);
    }

    #[test]
    fn test_terrain_registered_with_world() {
        let sim = headless(MockWorld::default());
        assert_eq!(sim.obstacles().len(), 10);
        assert_eq!(sim.world().static_bodies(), 10);
        assert_eq!(sim.terrain_seed(), 17);
        assert!(sim.obstacles().iter().all(|o| o.fixed));
    }

    #[test]
    fn test_empty_terrain_leaves_world_untouched() {
        let sim = Simulation::new(config(0), MockWorld::default(), &RobotSpec::quadruped(), None)
            .unwrap();
        assert!(sim.obstacles().is_empty());
        assert_eq!(sim.world().static_bodies(), 0);
        assert_eq!(sim.world().steps, 0);
    }

    #[test]
    fn test_same_seed_same_terrain() {
        let a = headless(MockWorld::default());
        let b = headless(MockWorld::default());
        assert_eq!(a.obstacles(), b.obstacles());
    }

    #[test]
    fn test_physics_failure_propagates() {
        let mut sim = headless(MockWorld {
            fail_at: Some(3),
            ..MockWorld::default()
        });
        let err = sim.run(&[0.5; 19], 0.01, 1.0).unwrap_err();
        assert!(matches!(err, SimError::Physics(_)));
        assert!(!err.is_abort());
        assert_eq!(sim.world().steps, 3);
    }

    #[test]
    fn test_viewer_sees_terrain_and_frames() {
        let log = Rc::new(RefCell::new(ViewerLog::default()));
        let viewer = MockViewer { log: log.clone(), abort: false };
        let cfg = SimulationConfig {
            headless: false,
            ..config(4)
        };
        let spec = RobotSpec::quadruped();
        let viewer: Box<dyn Visualizer> = Box::new(viewer);
        let mut sim = Simulation::new(cfg, MockWorld::default(), &spec, Some(viewer)).unwrap();
        sim.run(&[0.5; 19], 0.01, 0.1).unwrap();

        let log = log.borrow();
        assert!(log.attached);
        assert_eq!(log.obstacles, 4);
        assert_eq!(log.frames, 10);
    }

    #[test]
    fn test_abort_stops_before_stepping() {
        let log = Rc::new(RefCell::new(ViewerLog::default()));
        let viewer = MockViewer { log: log.clone(), abort: true };
        let cfg = SimulationConfig {
            headless: false,
            ..config(2)
        };
        let spec = RobotSpec::quadruped();
        let viewer: Box<dyn Visualizer> = Box::new(viewer);
        let mut sim = Simulation::new(cfg, MockWorld::default(), &spec, Some(viewer)).unwrap();
        let err = sim.run(&[0.5; 19], 0.01, 1.0).unwrap_err();
        assert!(err.is_abort());
        assert_eq!(sim.world().steps, 0);
        assert_eq!(log.borrow().frames, 0);
    }

    #[test]
    fn test_headless_ignores_viewer_abort() {
        let log = Rc::new(RefCell::new(ViewerLog::default()));
        let viewer = MockViewer { log: log.clone(), abort: true };
        let spec = RobotSpec::quadruped();
        let viewer: Box<dyn Visualizer> = Box::new(viewer);
        let cfg = config(2);
        let mut sim = Simulation::new(cfg, MockWorld::default(), &spec, Some(viewer)).unwrap();
        sim.run(&[0.5; 19], 0.01, 0.1).unwrap();
        assert_eq!(sim.world().steps, 10);
        assert!(!log.borrow().attached);
    }

    #[test]
    fn test_twist_centered_at_spawn() {
        let mut sim = headless(MockWorld::default());
        assert_eq!(sim.robot().twist, vec![Some(0.0); 10]);
        sim.run(&[0.9; 19], 0.01, 0.1).unwrap();
        // Gait commands never touch the twist axis.
        assert_eq!(sim.robot().twist, vec![Some(0.0); 10]);
    }

    #[test]
    fn test_rendering_requires_viewer() {
        let cfg = SimulationConfig {
            headless: false,
            ..config(2)
        };
        let result = Simulation::new(cfg, MockWorld::default(), &RobotSpec::quadruped(), None);
        assert!(matches!(result, Err(SimError::MissingViewer)));
    }

    #[test]
    fn test_robot_too_small() {
        let spec = RobotSpec {
            servos: 4,
            ..RobotSpec::quadruped()
        };
        let result = Simulation::new(config(2), MockWorld::default(), &spec, None);
        assert!(matches!(result, Err(SimError::TooFewServos { .. })));
    }
}
