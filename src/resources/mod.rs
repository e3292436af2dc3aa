pub mod kibanas;
