//! CPG-style gait controller.
//!
//! Every joint group runs the same open-loop oscillator
//!
//! ```text
//! phase(x) = a · tanh(h · sin(f·π·(x + θ))) + b      [degrees]
//! ```
//!
//! with `(a, θ, b)` decoded from three genes and `f` shared by all groups
//! (the last gene). `h` sharpens the sinusoid towards a square wave. Angles are
//! a pure function of time and genome: no per-joint memory.

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

pub const GENES_PER_GROUP: usize = 3;

const AMPLITUDE_SCALE: f64 = 40.0;
/// Decoded amplitudes below this are zeroed.
const AMPLITUDE_DEADBAND: f64 = 5.0;
const PHASE_SCALE: f64 = 1.0;
const BIAS_SCALE: f64 = 40.0;
const BIAS_OFFSET: f64 = 20.0;
/// Maximum frequency in Hz for a frequency gene of 1.
const FREQUENCY_SCALE: f64 = 2.0;
const SATURATION: f64 = 4.0;

/// Spine joints driven one servo each.
const BODY_GROUPS: usize = 2;
/// Servo distance between a joint and its mirror on the other side.
const MIRROR_OFFSET: usize = 4;
/// Outer leg joints get extra swing so they are not stunted.
const OUTER_GROUPS: [usize; 2] = [6, 9];
const OUTER_GAIN: f64 = 1.8;

/// Raw genes of one joint group, each nominally in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupGenes {
    pub amplitude: f64,
    pub phase: f64,
    pub bias: f64,
}

/// Decoded oscillator parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Oscillator {
    /// Amplitude in degrees (after the deadband).
    pub a: f64,
    /// Phase offset in seconds.
    pub theta: f64,
    /// Bias in degrees.
    pub b: f64,
    pub f: f64,
}

impl Oscillator {
    pub fn decode(genes: GroupGenes, frequency_gene: f64) -> Self {
        let mut a = genes.amplitude * AMPLITUDE_SCALE;
        if a < AMPLITUDE_DEADBAND {
            a = 0.0;
        }
        Oscillator {
            a,
            theta: genes.phase * PHASE_SCALE,
            b: genes.bias * BIAS_SCALE - BIAS_OFFSET,
            f: frequency_gene * FREQUENCY_SCALE,
        }
    }

    /// Joint phase in degrees at time `x`.
    pub fn phase(&self, x: f64) -> f64 {
        let wave = (self.f * std::f64::consts::PI * (x + self.theta)).sin();
        self.a * (SATURATION * wave).tanh() + self.b
    }
}

/// Phase in degrees for one group, before the group gain.
pub fn phase(x: f64, genes: GroupGenes, frequency_gene: f64) -> f64 {
    Oscillator::decode(genes, frequency_gene).phase(x)
}

/// One logical joint group: which servos it drives and how hard.
#[derive(Debug, Clone, PartialEq)]
pub struct JointGroup {
    pub index: usize,
    pub servos: Vec<usize>,
    pub gain: f64,
}

impl JointGroup {
    /// Servo target in radians.
    pub fn target(&self, x: f64, genes: GroupGenes, frequency_gene: f64) -> f64 {
        (phase(x, genes, frequency_gene) * self.gain).to_radians()
    }
}

/// Genome checked against a joint table. Remembers how many groups it was
/// checked for, so a table of another size refuses it.
#[derive(Debug, Clone, Copy)]
pub struct Genome<'a> {
    genes: &'a [f64],
    groups: usize,
}

impl<'a> Genome<'a> {
    pub fn group(&self, index: usize) -> Option<GroupGenes> {
        if index >= self.groups {
            return None;
        }
        let base = index * GENES_PER_GROUP;
        Some(GroupGenes {
            amplitude: self.genes[base],
            phase: self.genes[base + 1],
            bias: self.genes[base + 2],
        })
    }

    /// Shared frequency gene (always the last one).
    pub fn frequency(&self) -> f64 {
        self.genes[self.genes.len() - 1]
    }

    fn group_genes(&self) -> impl Iterator<Item = GroupGenes> + 'a {
        let genes: &'a [f64] = &self.genes[..self.groups * GENES_PER_GROUP];
        genes.chunks_exact(GENES_PER_GROUP).map(|g| GroupGenes {
            amplitude: g[0],
            phase: g[1],
            bias: g[2],
        })
    }
}

/// Behavior descriptor: how much the gait lifts vs sweeps its legs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GaitDescriptor {
    pub lift: f64,
    pub sweep: f64,
}

/// Group → servo map, built once per robot.
#[derive(Debug, Clone, PartialEq)]
pub struct JointTable {
    groups: Vec<JointGroup>,
    servos: usize,
}

impl JointTable {
    /// Table for a robot laid out as spine joints, one side, then the
    /// mirrored side. The last `MIRROR_OFFSET` servos are only reachable as
    /// mirrors, so the robot has `servos - MIRROR_OFFSET` groups.
    pub fn mirrored(servos: usize) -> SimResult<Self> {
        if servos <= MIRROR_OFFSET {
            return Err(SimError::TooFewServos {
                servos,
                required: MIRROR_OFFSET + 1,
            });
        }

        let groups = (0..servos - MIRROR_OFFSET)
            .map(|i| JointGroup {
                index: i,
                servos: if i < BODY_GROUPS {
                    vec![i]
                } else {
                    vec![i, i + MIRROR_OFFSET]
                },
                gain: if OUTER_GROUPS.contains(&i) { OUTER_GAIN } else { 1.0 },
            })
            .collect();

        Ok(JointTable { groups, servos })
    }

    pub fn groups(&self) -> &[JointGroup] {
        &self.groups
    }

    pub fn servo_count(&self) -> usize {
        self.servos
    }

    /// Required genome length: three genes per group plus the frequency gene.
    pub fn genome_len(&self) -> usize {
        self.groups.len() * GENES_PER_GROUP + 1
    }

    pub fn genome<'a>(&self, genes: &'a [f64]) -> SimResult<Genome<'a>> {
        if genes.len() != self.genome_len() {
            return Err(SimError::ParameterLength {
                expected: self.genome_len(),
                actual: genes.len(),
            });
        }
        Ok(Genome {
            genes,
            groups: self.groups.len(),
        })
    }

    fn check(&self, genome: &Genome<'_>) -> SimResult<()> {
        if genome.groups != self.groups.len() {
            return Err(SimError::ParameterLength {
                expected: self.genome_len(),
                actual: genome.genes.len(),
            });
        }
        Ok(())
    }

    /// `(servo, radians)` for every driven servo at time `x`, in group order.
    pub fn commands<'a>(
        &'a self,
        x: f64,
        genome: &Genome<'a>,
    ) -> SimResult<impl Iterator<Item = (usize, f64)> + 'a> {
        self.check(genome)?;
        let frequency = genome.frequency();
        Ok(self
            .groups
            .iter()
            .zip(genome.group_genes())
            .flat_map(move |(g, genes)| {
                let angle = g.target(x, genes, frequency);
                g.servos.iter().map(move |&s| (s, angle))
            }))
    }

    /// Mean amplitude gene of lifting groups (even, past the spine) and of
    /// sweeping groups (odd, past the spine).
    pub fn descriptor(&self, genome: &Genome<'_>) -> SimResult<GaitDescriptor> {
        self.check(genome)?;
        let mut sums = [0.0; 2];
        let mut counts = [0usize; 2];
        for (g, genes) in self.groups.iter().zip(genome.group_genes()) {
            if g.index >= BODY_GROUPS {
                sums[g.index % 2] += genes.amplitude;
                counts[g.index % 2] += 1;
            }
        }
        let mean = |parity: usize| {
            if counts[parity] == 0 {
                0.0
            } else {
                sums[parity] / counts[parity] as f64
            }
        };
        Ok(GaitDescriptor {
            lift: mean(0),
            sweep: mean(1),
        })
    }
}
