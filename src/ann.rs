use rand::prelude::*;
use rand_distr::StandardNormal;
use std::collections::{HashMap, HashSet};

use crate::config::Number;

const SEED: u64 = 42;

/// Random-projection LSH over entry positions. It only proposes candidates;
/// the caller scores them exactly.
pub struct RandomProjectionIndex {
    random_vectors: Vec<Vec<Number>>,
    hash_tables: Vec<HashMap<u64, Vec<usize>>>,
    num_tables: usize,
    num_projections: usize,
}

impl RandomProjectionIndex {
    pub fn new(dim: usize, num_projections: usize, num_tables: usize) -> Self {
        let num_projections = num_projections.clamp(1, 63);
        let num_tables = num_tables.max(1);
        let mut rng = StdRng::seed_from_u64(SEED);

        let random_vectors: Vec<Vec<Number>> = (0..num_tables * num_projections)
            .map(|_| (0..dim).map(|_| rng.sample::<Number, _>(StandardNormal)).collect())
            .collect();

        log::debug!(
            "ann index: {} projections x {} tables over {} dimensions",
            num_projections,
            num_tables,
            dim
        );

        RandomProjectionIndex {
            random_vectors,
            hash_tables: vec![HashMap::new(); num_tables],
            num_tables,
            num_projections,
        }
    }

    fn hash_vector(&self, vector: &[Number], table_index: usize) -> u64 {
        let start = table_index * self.num_projections;
        let end = start + self.num_projections;

        self.random_vectors[start..end]
            .iter()
            .map(|rv| rv.iter().zip(vector).map(|(&a, &b)| a * b).sum::<Number>())
            .enumerate()
            .fold(0u64, |acc, (i, proj)| if proj >= 0.0 { acc | (1 << i) } else { acc })
    }

    pub fn add(&mut self, vector: &[Number], position: usize) {
        for table in 0..self.num_tables {
            let hash = self.hash_vector(vector, table);
            self.hash_tables[table].entry(hash).or_default().push(position);
        }
    }

    pub fn clear(&mut self) {
        for table in &mut self.hash_tables {
            table.clear();
        }
    }

    /// Positions sharing a bucket with `query`, or one bit away from it, in any table.
    pub fn candidates(&self, query: &[Number]) -> HashSet<usize> {
        let mut candidates = HashSet::new();

        for (table_index, table) in self.hash_tables.iter().enumerate() {
            let query_hash = self.hash_vector(query, table_index);

            if let Some(bucket) = table.get(&query_hash) {
                candidates.extend(bucket);
            }

            for bit in 0..self.num_projections {
                if let Some(bucket) = table.get(&(query_hash ^ (1 << bit))) {
                    candidates.extend(bucket);
                }
            }
        }

        log::trace!("ann lookup returned {} candidates", candidates.len());
        candidates
    }
}
