// Bounded play field geometry shared by the server and client sessions.

/// Integer pixel position inside the play field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Arrow-key style movement used by client sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
}

/// Fixed play field: positions live in `0..=width` x `0..=height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayField {
    pub width: i32,
    pub height: i32,
    /// Distance covered by a single client step.
    pub step: i32,
}

impl Default for PlayField {
    fn default() -> Self {
        Self {
            width: 800,
            height: 400,
            step: 20,
        }
    }
}

impl PlayField {
    pub fn contains(&self, pos: Position) -> bool {
        (0..=self.width).contains(&pos.x) && (0..=self.height).contains(&pos.y)
    }

    pub fn clamp(&self, pos: Position) -> Position {
        Position {
            x: pos.x.clamp(0, self.width),
            y: pos.y.clamp(0, self.height),
        }
    }

    /// Applies one step in `direction`, or `None` when the step would leave the field.
    pub fn step(&self, pos: Position, direction: Direction) -> Option<Position> {
        let next = match direction {
            Direction::Left => Position::new(pos.x - self.step, pos.y),
            Direction::Right => Position::new(pos.x + self.step, pos.y),
            Direction::Up => Position::new(pos.x, pos.y - self.step),
            Direction::Down => Position::new(pos.x, pos.y + self.step),
        };
        self.contains(next).then_some(next)
    }
}
