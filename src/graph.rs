use anyhow::{bail, Context, Result};
use std::fs;

/// Grid cell with its 4-connected passable neighbours. Immutable after load.
#[derive(Debug, Clone)]
pub struct Vertex {
    pub id: usize,
    pub x: usize,
    pub y: usize,
    pub neighbors: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct Graph {
    height: usize,
    width: usize,
    vertices: Vec<Option<Vertex>>,
}

impl Graph {
    pub fn from_file(path: &str) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("error@graph: map file {path} is not found"))?;
        Self::from_map_text(&text)
    }

    /// Parses the movingai grid format: `type`, `height N`, `width N`, `map`,
    /// then one row of cells per line, `.` passable.
    pub fn from_map_text(text: &str) -> Result<Self> {
        let mut lines = text.lines();

        let _type = next_header_line(&mut lines)?;
        let height = parse_header_value(next_header_line(&mut lines)?)?;
        let width = parse_header_value(next_header_line(&mut lines)?)?;
        let _map = next_header_line(&mut lines)?;

        let mut vertices: Vec<Option<Vertex>> = vec![None; width * height];
        for y in 0..height {
            let row = lines
                .next()
                .with_context(|| format!("error@graph: map row {y} is missing"))?;
            let row = row.trim_end_matches('\r');
            for (x, ch) in row.chars().take(width).enumerate() {
                if ch == '.' {
                    let id = y * width + x;
                    vertices[id] = Some(Vertex {
                        id,
                        x,
                        y,
                        neighbors: Vec::new(),
                    });
                }
            }
        }

        let mut graph = Graph {
            height,
            width,
            vertices,
        };
        graph.initialize_neighbors();
        Ok(graph)
    }

    fn initialize_neighbors(&mut self) {
        let directions: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
        let coords: Vec<(usize, i64, i64)> = self
            .vertices
            .iter()
            .flatten()
            .map(|v| (v.id, v.x as i64, v.y as i64))
            .collect();
        for (id, x, y) in coords {
            let mut neighbors = Vec::new();
            for &(dx, dy) in &directions {
                let nx = x + dx;
                let ny = y + dy;
                if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
                    continue;
                }
                let nid = ny as usize * self.width + nx as usize;
                if self.vertices[nid].is_some() {
                    neighbors.push(nid);
                }
            }
            if let Some(vertex) = self.vertices[id].as_mut() {
                vertex.neighbors = neighbors;
            }
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Table-sizing bound; also the distance-table marker for "unreachable".
    pub fn size(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex(&self, id: usize) -> Option<&Vertex> {
        self.vertices.get(id).and_then(|v| v.as_ref())
    }

    pub fn exists(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.vertices[y * self.width + x].is_some()
    }

    pub fn id_of(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    pub fn pos(&self, id: usize) -> (usize, usize) {
        match self.vertex(id) {
            Some(vertex) => (vertex.x, vertex.y),
            None => (id % self.width, id / self.width),
        }
    }

    pub fn neighbors(&self, id: usize) -> &[usize] {
        match self.vertex(id) {
            Some(vertex) => &vertex.neighbors,
            None => &[],
        }
    }
}

fn next_header_line<'a>(lines: &mut impl Iterator<Item = &'a str>) -> Result<&'a str> {
    match lines.next() {
        Some(line) => Ok(line.trim_end_matches('\r')),
        None => bail!("error@graph: truncated map header"),
    }
}

fn parse_header_value(line: &str) -> Result<usize> {
    line.split_whitespace()
        .last()
        .with_context(|| format!("error@graph: malformed header line {line:?}"))?
        .parse::<usize>()
        .with_context(|| format!("error@graph: malformed header line {line:?}"))
}
